//! Авторегрессионный декодер с внешним источником teacher forcing.
//!
//! Шаг t:
//! 1. внимание по текущему h и весам шага t-1
//! 2. вход: эмбеддинг эталонного токена (teacher forcing) или своего
//!    предыдущего argmax
//! 3. LSTMCell([emb; context], (h, c))
//! 4. логиты = output_layer(h), предсказание = argmax
//!
//! После цикла log_softmax по словарю и выборка log-вероятности эталона
//! (или своего предсказания в режиме свободной генерации).
//!
//! Весовые ключи (`decoder.*`):
//! - embedding.weight: [vocab, hidden], строка `pad` обнуляется при загрузке
//! - LSTMCell.{weight,bias}_{ih,hh}: [4*hidden, att_odim + hidden] / [4*hidden, hidden]
//! - output_layer.{weight,bias}: [vocab, hidden]

use candle_core::{bail, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder};
use tracing::{debug, trace};

use asr_core::pad_list;

use crate::attention::{AttentionState, MultiHeadLocationAttention};
use crate::config::{DecodeOptions, LasConfig};
use crate::forcing::ForcingPolicy;
use crate::lstm::{LstmCell, LstmState};
use crate::sequence::PaddedSequence;

/// Выход декодера.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Выбранные log-вероятности [B, L].
    pub log_probs: Tensor,
    /// Argmax на каждом шаге [B, L] (u32).
    pub predictions: Tensor,
    /// Веса внимания: по шагу, по голове, [B, T].
    pub attention: Vec<Vec<Tensor>>,
    /// Подавался ли эталон на шаге t.
    pub teacher_forced: Vec<bool>,
}

impl DecoderOutput {
    pub fn num_steps(&self) -> usize {
        self.teacher_forced.len()
    }
}

/// Входы и выходы для режима с эталонами: `[bos] + y` и `y + [eos]`, [B, L].
struct TargetTensors {
    ys_in: Tensor,
    ys_out: Tensor,
    len: usize,
}

/// Эмбеддинг с нулевой строкой `pad`: дополнение не даёт вклада ни во вход
/// LSTMCell, ни в градиент таблицы.
fn pad_masked_embedding(vocab_size: usize, hidden: usize, pad: u32, vb: VarBuilder) -> Result<Embedding> {
    let init = candle_nn::Init::Randn { mean: 0., stdev: 1. };
    let weight = vb.get_with_hints((vocab_size, hidden), "weight", init)?;
    let keep: Vec<f32> = (0..vocab_size)
        .map(|i| if i == pad as usize { 0.0 } else { 1.0 })
        .collect();
    let keep = Tensor::from_vec(keep, (vocab_size, 1), weight.device())?.to_dtype(weight.dtype())?;
    let weight = weight.broadcast_mul(&keep)?;
    Ok(Embedding::new(weight, hidden))
}

#[derive(Debug, Clone)]
pub struct Decoder {
    embedding: Embedding,
    cell: LstmCell,
    output_layer: Linear,
    vocab_size: usize,
    pad: u32,
    bos: u32,
    eos: u32,
}

impl Decoder {
    pub fn load(config: &LasConfig, vb: VarBuilder) -> Result<Self> {
        let vocab_size = config.vocab_size();
        let hidden = config.dec_hidden_dim;
        let embedding = pad_masked_embedding(vocab_size, hidden, config.pad, vb.pp("embedding"))?;
        let cell = LstmCell::load(config.att_odim + hidden, hidden, "", vb.pp("LSTMCell"))?;
        let output_layer = candle_nn::linear(hidden, vocab_size, vb.pp("output_layer"))?;
        debug!(
            "Decoder загружен: vocab={}, LSTMCell({} → {})",
            vocab_size,
            config.att_odim + hidden,
            hidden
        );
        Ok(Self {
            embedding,
            cell,
            output_layer,
            vocab_size,
            pad: config.pad,
            bos: config.bos,
            eos: config.eos,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn prepare_targets(&self, targets: &[Vec<u32>], batch: usize, device: &Device) -> Result<TargetTensors> {
        if targets.len() != batch {
            bail!("Decoder: {} последовательностей целей на батч {batch}", targets.len());
        }
        for (b, y) in targets.iter().enumerate() {
            if let Some(&bad) = y.iter().find(|&&id| id as usize >= self.vocab_size) {
                bail!(
                    "Decoder: токен {bad} в цели {b} вне словаря [0, {})",
                    self.vocab_size
                );
            }
        }
        let ys_in: Vec<Vec<u32>> = targets
            .iter()
            .map(|y| std::iter::once(self.bos).chain(y.iter().copied()).collect())
            .collect();
        let ys_out: Vec<Vec<u32>> = targets
            .iter()
            .map(|y| y.iter().copied().chain(std::iter::once(self.eos)).collect())
            .collect();
        let ys_in = pad_list(&ys_in, self.pad);
        let ys_out = pad_list(&ys_out, self.pad);
        let len = ys_out[0].len();
        let to_tensor = |rows: Vec<Vec<u32>>| {
            Tensor::from_vec(rows.into_iter().flatten().collect::<Vec<_>>(), (batch, len), device)
        };
        Ok(TargetTensors {
            ys_in: to_tensor(ys_in)?,
            ys_out: to_tensor(ys_out)?,
            len,
        })
    }

    /// Полный проход декодера.
    ///
    /// С целями число шагов равно дополненной длине `y + [eos]`, без них —
    /// `opts.max_dec_timesteps` (без остановки на `<EOS>`). Состояние
    /// внимания создаётся заново на каждый вызов.
    pub fn forward(
        &self,
        attention: &MultiHeadLocationAttention,
        enc: &PaddedSequence,
        init: LstmState,
        targets: Option<&[Vec<u32>]>,
        opts: &DecodeOptions,
        policy: &mut dyn ForcingPolicy,
    ) -> Result<DecoderOutput> {
        let batch = enc.batch_size();
        let device = enc.device().clone();
        let (hb, hd) = init.h.dims2()?;
        if hb != batch || hd != self.cell.hidden_size() {
            bail!(
                "Decoder: начальное состояние {:?}, ожидалось [{batch}, {}]",
                init.h.shape(),
                self.cell.hidden_size()
            );
        }

        let targets = targets
            .map(|ys| self.prepare_targets(ys, batch, &device))
            .transpose()?;
        let steps = targets.as_ref().map_or(opts.max_dec_timesteps, |t| t.len);
        let forced_inputs = targets
            .as_ref()
            .map(|t| self.embedding.forward(&t.ys_in))
            .transpose()?;
        if steps == 0 {
            bail!("Decoder: нулевое число шагов декодирования");
        }

        let mut att_state = AttentionState::new();
        let mut state = init;
        let mut weights: Option<Vec<Tensor>> = None;
        let mut logits = Vec::with_capacity(steps);
        let mut predictions: Vec<Tensor> = Vec::with_capacity(steps);
        let mut attention_trace = Vec::with_capacity(steps);
        let mut teacher_forced = Vec::with_capacity(steps);

        for t in 0..steps {
            let att = attention.attend(
                &mut att_state,
                enc,
                Some(&state.h),
                weights.as_deref(),
                opts.scaling,
            )?;

            let (emb, forced) = match (&forced_inputs, predictions.last()) {
                (Some(eys), prev) => {
                    let coin = policy.use_ground_truth(t);
                    match prev {
                        Some(prev) if !coin => (self.embedding.forward(prev)?, false),
                        _ => (eys.narrow(1, t, 1)?.squeeze(1)?, true),
                    }
                }
                (None, Some(prev)) => (self.embedding.forward(prev)?, false),
                (None, None) => {
                    let bos = Tensor::full(self.bos, batch, &device)?;
                    (self.embedding.forward(&bos)?, false)
                }
            };

            let input = Tensor::cat(&[&emb, &att.context], D::Minus1)?;
            state = self.cell.step(&input, &state)?;
            let logit = self.output_layer.forward(&state.h)?;
            let pred = logit.argmax(D::Minus1)?;
            trace!("Decoder шаг {t}: forced={forced}");

            logits.push(logit);
            predictions.push(pred);
            attention_trace.push(att.weights.clone());
            teacher_forced.push(forced);
            weights = Some(att.weights);
        }

        // [B, L, V], нормировка по словарю
        let logits = Tensor::stack(&logits, 1)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        let predictions = Tensor::stack(&predictions, 1)?;
        let index = match &targets {
            Some(t) => t.ys_out.clone(),
            None => predictions.clone(),
        };
        let log_probs = log_probs.gather(&index.unsqueeze(2)?.contiguous()?, 2)?.squeeze(2)?;

        debug!(
            "Decoder: {steps} шагов, teacher forcing на {} из них",
            teacher_forced.iter().filter(|&&f| f).count()
        );
        Ok(DecoderOutput {
            log_probs,
            predictions,
            attention: attention_trace,
            teacher_forced,
        })
    }
}
