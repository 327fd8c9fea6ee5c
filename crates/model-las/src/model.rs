//! LasModel: энкодер → начальное состояние → декодер с вниманием.
//!
//! Загружается из директории с `config.json` и `model.safetensors`,
//! либо собирается из произвольного `VarBuilder` (например, `VarMap` со
//! случайной инициализацией для обучения и тестов).

use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, info, warn};

use asr_core::{AsrError, AsrResult};

use crate::attention::{AttentionDims, MultiHeadLocationAttention};
use crate::config::{DecodeOptions, LasConfig};
use crate::decoder::{Decoder, DecoderOutput};
use crate::encoder::Encoder;
use crate::forcing::{ForcingPolicy, RandomForcing};
use crate::sequence::PaddedSequence;
use crate::state_transform::StateTransform;

/// Результат прохода модели.
#[derive(Debug, Clone)]
pub struct LasOutput {
    /// Log-вероятности эталона или своего предсказания [B, L].
    pub log_probs: Tensor,
    /// Argmax по шагам [B, L] (u32).
    pub predictions: Tensor,
    /// Веса внимания: по шагу, по голове, [B, T_enc].
    pub attention: Vec<Vec<Tensor>>,
    /// Решения teacher forcing по шагам.
    pub teacher_forced: Vec<bool>,
    /// Длины выхода энкодера.
    pub encoder_lens: Vec<usize>,
}

impl LasOutput {
    fn from_decoder(out: DecoderOutput, encoder_lens: Vec<usize>) -> Self {
        Self {
            log_probs: out.log_probs,
            predictions: out.predictions,
            attention: out.attention,
            teacher_forced: out.teacher_forced,
            encoder_lens,
        }
    }

    /// Предсказания по высказываниям, каждое обрезано перед первым `eos`.
    pub fn hypotheses(&self, eos: u32) -> AsrResult<Vec<Vec<u32>>> {
        let rows: Vec<Vec<u32>> = self.predictions.to_vec2()?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().take_while(|&id| id != eos).collect())
            .collect())
    }
}

/// Seq2seq модель с location-aware вниманием.
#[derive(Debug, Clone)]
pub struct LasModel {
    encoder: Encoder,
    state_transform: StateTransform,
    attention: MultiHeadLocationAttention,
    decoder: Decoder,
    config: LasConfig,
    device: Device,
}

impl LasModel {
    /// Собрать модель из `VarBuilder`. Ключи верхнего уровня: `encoder`,
    /// `state_transform`, `attention`, `decoder`.
    pub fn new(config: LasConfig, vb: VarBuilder) -> AsrResult<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let encoder = Encoder::load(&config, vb.pp("encoder"))?;
        let state_transform =
            StateTransform::load(config.encoder_dim(), config.dec_hidden_dim, vb.pp("state_transform"))?;
        let attention = MultiHeadLocationAttention::load(
            AttentionDims::from_config(&config),
            config.mask_padding,
            vb.pp("attention"),
        )?;
        let decoder = Decoder::load(&config, vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            state_transform,
            attention,
            decoder,
            config,
            device,
        })
    }

    /// Загрузить модель из директории.
    ///
    /// Ожидаемые файлы:
    /// - config.json (если нет, берутся гиперпараметры WSJ)
    /// - model.safetensors
    pub fn load(model_dir: impl AsRef<Path>, device: &Device) -> AsrResult<Self> {
        let model_dir = model_dir.as_ref();
        info!("Загрузка LAS из {:?}", model_dir);
        let start = Instant::now();

        let config_path = model_dir.join("config.json");
        let config = if config_path.exists() {
            LasConfig::from_file(&config_path)?
        } else {
            warn!("config.json не найден, используем дефолтные значения");
            LasConfig::default()
        };

        let safetensors_path = model_dir.join("model.safetensors");
        if !safetensors_path.exists() {
            return Err(AsrError::Model(format!(
                "model.safetensors не найден в {:?}",
                model_dir
            )));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&safetensors_path], DType::F32, device)? };
        let model = Self::new(config, vb)?;

        info!(
            "LAS загружена за {:.2?}: ~{:.1}M параметров",
            start.elapsed(),
            model.config.num_parameters() as f64 / 1e6
        );
        Ok(model)
    }

    pub fn config(&self) -> &LasConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Проход с seedable teacher forcing (`opts.tf_rate`, `opts.seed`).
    pub fn forward(
        &self,
        features: &Tensor,
        lens: &[usize],
        targets: Option<&[Vec<u32>]>,
        opts: &DecodeOptions,
    ) -> AsrResult<LasOutput> {
        let mut policy = RandomForcing::new(opts.tf_rate, opts.seed);
        self.forward_with_policy(features, lens, targets, opts, &mut policy)
    }

    /// Проход с произвольным источником решений teacher forcing.
    pub fn forward_with_policy(
        &self,
        features: &Tensor,
        lens: &[usize],
        targets: Option<&[Vec<u32>]>,
        opts: &DecodeOptions,
        policy: &mut dyn ForcingPolicy,
    ) -> AsrResult<LasOutput> {
        let (batch, _, feat_dim) = features.dims3()?;
        if feat_dim != self.config.input_dim {
            return Err(AsrError::Shape(format!(
                "признаки {:?}: ожидалось {} на фрейм",
                features.shape(),
                self.config.input_dim
            )));
        }
        if lens.len() != batch {
            return Err(AsrError::Shape(format!(
                "длины {:?} не совпадают с батчем {:?}",
                lens,
                features.shape()
            )));
        }
        if let Some(ys) = targets {
            self.validate_targets(ys, batch)?;
        }

        let xs = PaddedSequence::new(features.clone(), lens.to_vec())
            .map_err(|e| AsrError::Shape(e.to_string()))?;
        let enc = self.encoder.forward_t(&xs, opts.train)?;
        debug!("Энкодер: {:?}, длины {:?}", enc.data().shape(), enc.lens());

        let init = self.state_transform.forward(&enc)?;
        let out = self
            .decoder
            .forward(&self.attention, &enc, init, targets, opts, policy)?;
        Ok(LasOutput::from_decoder(out, enc.lens().to_vec()))
    }

    /// Жадное распознавание: свободная генерация на `max_steps` шагов,
    /// затем обрезка по первому `eos`.
    pub fn recognize(&self, features: &Tensor, lens: &[usize], max_steps: usize) -> AsrResult<Vec<Vec<u32>>> {
        let opts = DecodeOptions::default().with_max_dec_timesteps(max_steps);
        let out = self.forward(features, lens, None, &opts)?;
        out.hypotheses(self.config.eos)
    }

    fn validate_targets(&self, targets: &[Vec<u32>], batch: usize) -> AsrResult<()> {
        if targets.len() != batch {
            return Err(AsrError::InvalidInput(format!(
                "{} последовательностей целей на батч {batch}",
                targets.len()
            )));
        }
        let vocab = self.config.vocab_size();
        for (b, y) in targets.iter().enumerate() {
            if let Some(&bad) = y.iter().find(|&&id| id as usize >= vocab) {
                return Err(AsrError::InvalidInput(format!(
                    "токен {bad} в цели {b} вне словаря [0, {vocab})"
                )));
            }
        }
        Ok(())
    }
}
