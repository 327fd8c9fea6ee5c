//! Конфигурация модели LAS (Listen, Attend and Spell).

use std::path::Path;

use serde::{Deserialize, Serialize};

use asr_core::{AsrError, AsrResult, BOS_ID, EOS_ID, PAD_ID};

/// Количество выходных каналов VGG2L.
pub const VGG_OUT_CHANNELS: usize = 128;

/// Зарезервированные токены: `<PAD>`, `<BOS>`, `<EOS>`.
pub const NUM_SPECIAL_TOKENS: usize = 3;

fn default_in_channel() -> usize {
    1
}

fn default_heads() -> usize {
    4
}

fn default_pad() -> u32 {
    PAD_ID
}

fn default_bos() -> u32 {
    BOS_ID
}

fn default_eos() -> u32 {
    EOS_ID
}

fn default_true() -> bool {
    true
}

/// Корневая конфигурация модели (`config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LasConfig {
    /// Размерность входных признаков на фрейм (40 fbank).
    pub input_dim: usize,

    /// На сколько каналов VGG2L режет ось признаков.
    #[serde(default = "default_in_channel")]
    pub in_channel: usize,

    /// Скрытый размер одного направления BLSTM энкодера.
    pub enc_hidden_dim: usize,

    /// Количество слоёв BLSTM.
    pub enc_n_layers: usize,

    /// Фактор прореживания по времени после каждого слоя BLSTM.
    pub subsample: Vec<usize>,

    /// Вероятность dropout после слоёв BLSTM.
    pub dropout_rate: f32,

    /// Скрытый размер LSTM-ячейки декодера (и эмбеддинга).
    pub dec_hidden_dim: usize,

    /// Размерность пространства внимания.
    pub att_dim: usize,

    /// Количество каналов location-свёртки.
    pub conv_channels: usize,

    /// Размер ядра location-свёртки.
    pub conv_kernel_size: usize,

    /// Размерность объединённого контекст-вектора.
    pub att_odim: usize,

    /// Количество контентных токенов (без трёх зарезервированных).
    pub output_dim: usize,

    #[serde(default = "default_pad")]
    pub pad: u32,

    #[serde(default = "default_bos")]
    pub bos: u32,

    #[serde(default = "default_eos")]
    pub eos: u32,

    /// Количество голов внимания.
    #[serde(default = "default_heads")]
    pub heads: usize,

    /// Маскировать дополненные фреймы перед softmax внимания.
    ///
    /// `false` воспроизводит немаскированное поведение, при котором веса
    /// протекают на хвосты коротких высказываний.
    #[serde(default = "default_true")]
    pub mask_padding: bool,
}

impl Default for LasConfig {
    fn default() -> Self {
        Self::wsj()
    }
}

impl LasConfig {
    /// Гиперпараметры WSJ (BPE, 500 юнитов).
    pub fn wsj() -> Self {
        Self {
            input_dim: 40,
            in_channel: 1,
            enc_hidden_dim: 800,
            enc_n_layers: 3,
            subsample: vec![1, 2, 1],
            dropout_rate: 0.3,
            dec_hidden_dim: 1024,
            att_dim: 512,
            conv_channels: 10,
            conv_kernel_size: 201,
            att_odim: 800,
            output_dim: 500,
            pad: PAD_ID,
            bos: BOS_ID,
            eos: EOS_ID,
            heads: 4,
            mask_padding: true,
        }
    }

    /// Загрузить конфигурацию из JSON-файла.
    pub fn from_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| AsrError::Config(format!("Ошибка парсинга config.json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Проверить структурную согласованность.
    pub fn validate(&self) -> AsrResult<()> {
        let dims = [
            ("input_dim", self.input_dim),
            ("in_channel", self.in_channel),
            ("enc_hidden_dim", self.enc_hidden_dim),
            ("enc_n_layers", self.enc_n_layers),
            ("dec_hidden_dim", self.dec_hidden_dim),
            ("att_dim", self.att_dim),
            ("conv_channels", self.conv_channels),
            ("conv_kernel_size", self.conv_kernel_size),
            ("att_odim", self.att_odim),
            ("output_dim", self.output_dim),
            ("heads", self.heads),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(AsrError::Config(format!("{name} должен быть > 0")));
        }
        if self.input_dim % self.in_channel != 0 {
            return Err(AsrError::Config(format!(
                "input_dim={} не делится на in_channel={}",
                self.input_dim, self.in_channel
            )));
        }
        if self.subsample.len() != self.enc_n_layers {
            return Err(AsrError::Config(format!(
                "subsample содержит {} значений, а слоёв энкодера {}",
                self.subsample.len(),
                self.enc_n_layers
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(AsrError::Config(format!(
                "dropout_rate={} вне [0, 1)",
                self.dropout_rate
            )));
        }
        let specials = [self.pad, self.bos, self.eos];
        if specials[0] == specials[1] || specials[1] == specials[2] || specials[0] == specials[2] {
            return Err(AsrError::Config(format!(
                "pad/bos/eos должны различаться: {specials:?}"
            )));
        }
        if let Some(id) = specials.iter().find(|&&id| id as usize >= self.vocab_size()) {
            return Err(AsrError::Config(format!(
                "служебный ID {id} вне словаря размера {}",
                self.vocab_size()
            )));
        }
        Ok(())
    }

    /// Полный размер выходного словаря: контентные токены + 3 служебных.
    pub fn vocab_size(&self) -> usize {
        self.output_dim + NUM_SPECIAL_TOKENS
    }

    /// Размерность выхода энкодера (два направления BLSTM).
    pub fn encoder_dim(&self) -> usize {
        self.enc_hidden_dim * 2
    }

    /// Размерность признаков на фрейм после VGG2L.
    pub fn vgg_output_dim(&self) -> usize {
        let freq = (self.input_dim / self.in_channel).div_ceil(2).div_ceil(2);
        freq * VGG_OUT_CHANNELS
    }

    /// Приблизительное количество обучаемых параметров.
    pub fn num_parameters(&self) -> u64 {
        let conv = |cin: usize, cout: usize| (cin * cout * 9 + cout) as u64;
        let lstm = |input: usize, hidden: usize| (4 * hidden * (input + hidden) + 8 * hidden) as u64;
        let linear = |i: usize, o: usize, bias: bool| (i * o + if bias { o } else { 0 }) as u64;

        let vgg = conv(self.in_channel, 64) + conv(64, 64) + conv(64, 128) + conv(128, 128);

        let enc_dim = self.encoder_dim();
        let blstm: u64 = (0..self.enc_n_layers)
            .map(|i| {
                let idim = if i == 0 { self.vgg_output_dim() } else { enc_dim };
                2 * lstm(idim, self.enc_hidden_dim)
            })
            .sum();

        let state = 2 * linear(enc_dim, self.dec_hidden_dim, true);

        let head = linear(enc_dim, self.att_dim, true)
            + linear(self.dec_hidden_dim, self.att_dim, false)
            + linear(self.conv_channels, self.att_dim, false)
            + (self.conv_channels * self.conv_kernel_size) as u64
            + linear(self.att_dim, 1, false);
        let attention =
            self.heads as u64 * head + linear(self.heads * enc_dim, self.att_odim, true);

        let vocab = self.vocab_size();
        let decoder = (vocab * self.dec_hidden_dim) as u64
            + lstm(self.att_odim + self.dec_hidden_dim, self.dec_hidden_dim)
            + linear(self.dec_hidden_dim, vocab, true);

        vgg + blstm + state + attention + decoder
    }
}

/// Параметры одного прохода декодера.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Вероятность teacher forcing на шаг (используется только с целями).
    pub tf_rate: f64,

    /// Количество шагов в режиме свободной генерации.
    pub max_dec_timesteps: usize,

    /// Множитель энергии перед softmax внимания.
    pub scaling: f64,

    /// Режим обучения: включает dropout энкодера.
    pub train: bool,

    /// Seed генератора для решений teacher forcing.
    pub seed: u64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            tf_rate: 0.8,
            max_dec_timesteps: 500,
            scaling: 1.0,
            train: false,
            seed: 0,
        }
    }
}

impl DecodeOptions {
    /// Значения полного прохода модели: всегда эталон, до 200 шагов без целей.
    ///
    /// `Default` соответствует проходу одного декодера (0.8 и 500 шагов).
    pub fn e2e() -> Self {
        Self {
            tf_rate: 1.0,
            max_dec_timesteps: 200,
            ..Self::default()
        }
    }

    pub fn with_tf_rate(mut self, tf_rate: f64) -> Self {
        self.tf_rate = tf_rate;
        self
    }

    pub fn with_max_dec_timesteps(mut self, steps: usize) -> Self {
        self.max_dec_timesteps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn training(mut self, train: bool) -> Self {
        self.train = train;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LasConfig::default();
        assert_eq!(config.input_dim, 40);
        assert_eq!(config.subsample, vec![1, 2, 1]);
        assert_eq!(config.heads, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_dims() {
        let config = LasConfig::wsj();
        assert_eq!(config.vocab_size(), 503);
        assert_eq!(config.encoder_dim(), 1600);
        // 40 → 20 → 10 частотных бинов × 128 каналов
        assert_eq!(config.vgg_output_dim(), 1280);
    }

    #[test]
    fn test_vgg_output_dim_rounds_up() {
        let config = LasConfig {
            input_dim: 83,
            ..LasConfig::wsj()
        };
        // 83 → 42 → 21
        assert_eq!(config.vgg_output_dim(), 21 * VGG_OUT_CHANNELS);
    }

    #[test]
    fn test_validate_subsample_len() {
        let config = LasConfig {
            subsample: vec![1, 2],
            ..LasConfig::wsj()
        };
        assert!(matches!(config.validate(), Err(AsrError::Config(_))));
    }

    #[test]
    fn test_validate_in_channel_divides_input() {
        let config = LasConfig {
            input_dim: 40,
            in_channel: 3,
            ..LasConfig::wsj()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{
            "input_dim": 40, "enc_hidden_dim": 8, "enc_n_layers": 2, "subsample": [1, 2],
            "dropout_rate": 0.1, "dec_hidden_dim": 16, "att_dim": 8, "conv_channels": 2,
            "conv_kernel_size": 4, "att_odim": 8, "output_dim": 10
        }"#;
        let config: LasConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.heads, 4);
        assert_eq!((config.pad, config.bos, config.eos), (0, 1, 2));
        assert!(config.mask_padding);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_decode_options_defaults() {
        let opts = DecodeOptions::default();
        assert_eq!(opts.tf_rate, 0.8);
        assert_eq!(opts.max_dec_timesteps, 500);
        assert_eq!(opts.scaling, 1.0);
    }

    #[test]
    fn test_decode_options_e2e() {
        let opts = DecodeOptions::e2e();
        assert_eq!(opts.tf_rate, 1.0);
        assert_eq!(opts.max_dec_timesteps, 200);
        assert_eq!(opts.scaling, 1.0);
        assert!(!opts.train);
        assert_eq!(opts, DecodeOptions::default().with_tf_rate(1.0).with_max_dec_timesteps(200));
    }
}
