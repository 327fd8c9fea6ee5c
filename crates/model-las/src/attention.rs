//! Многоголовое location-aware внимание.
//!
//! Для каждой головы h:
//!   f = conv1d(pad(w_prev))                        — location-признаки [B, C, T]
//!   e = gvec(tanh(mlp_enc(enc) + mlp_dec(z) + mlp_att(f)))
//!   w = softmax(scaling * e)                       — по оси времени
//!   c = Σ_t w_t · enc_t
//! Контексты голов конкатенируются и сводятся через `mlp_o`.
//!
//! Кэш проекций энкодера живёт не в модуле, а в [`AttentionState`], который
//! принадлежит вызывающему: каждый проход декодера заводит своё состояние.
//!
//! Весовые ключи (`attention.*`):
//! - mlp_enc.{h}.weight: [att_dim, enc_dim], mlp_enc.{h}.bias: [att_dim]
//! - mlp_dec.{h}.weight: [att_dim, dec_dim]
//! - mlp_att.{h}.weight: [att_dim, conv_channels]
//! - loc_conv.{h}.weight: [conv_channels, 1, 1, kernel]
//! - gvec.{h}.weight: [1, att_dim]
//! - mlp_o.weight: [att_odim, heads * enc_dim], mlp_o.bias: [att_odim]

use candle_core::{bail, DType, Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use tracing::{debug, trace};

use crate::config::LasConfig;
use crate::sequence::{uniform_weights, PaddedSequence};

/// Размеры модуля внимания.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub encoder_dim: usize,
    pub decoder_dim: usize,
    pub att_dim: usize,
    pub conv_channels: usize,
    pub conv_kernel_size: usize,
    pub heads: usize,
    pub att_odim: usize,
}

impl AttentionDims {
    pub fn from_config(config: &LasConfig) -> Self {
        Self {
            encoder_dim: config.encoder_dim(),
            decoder_dim: config.dec_hidden_dim,
            att_dim: config.att_dim,
            conv_channels: config.conv_channels,
            conv_kernel_size: config.conv_kernel_size,
            heads: config.heads,
            att_odim: config.att_odim,
        }
    }
}

/// Паддинг location-свёртки (слева, справа), сохраняющий длину.
///
/// Для чётного ядра разбиение несимметричное: `(k/2, k/2 - 1)`.
pub fn location_padding(kernel_size: usize) -> (usize, usize) {
    let half = kernel_size / 2;
    if kernel_size % 2 == 0 {
        (half, half - 1)
    } else {
        (half, half)
    }
}

/// Параметры одной головы.
#[derive(Debug, Clone)]
struct HeadParams {
    mlp_enc: Linear,
    mlp_dec: Linear,
    mlp_att: Linear,
    /// [C, 1, k]
    loc_conv: Tensor,
    gvec: Linear,
}

/// Закэшированный энкодер для одного прохода декодера.
#[derive(Debug, Clone)]
pub struct PrimedAttention {
    enc: Tensor,
    lens: Vec<usize>,
    /// Проекции `mlp_enc` по головам: [B, T, att_dim].
    projections: Vec<Tensor>,
    /// Маска валидных фреймов [B, T] (u8).
    mask: Tensor,
}

impl PrimedAttention {
    pub fn encoder(&self) -> &Tensor {
        &self.enc
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn projections(&self) -> &[Tensor] {
        &self.projections
    }
}

/// Состояние внимания: пусто до первого вызова, затем держит кэш энкодера.
#[derive(Debug, Clone, Default)]
pub enum AttentionState {
    #[default]
    Empty,
    Primed(PrimedAttention),
}

impl AttentionState {
    pub fn new() -> Self {
        Self::Empty
    }

    /// Сбросить кэш: следующий вызов пересчитает проекции.
    pub fn reset(&mut self) {
        *self = Self::Empty;
    }

    pub fn is_primed(&self) -> bool {
        matches!(self, Self::Primed(_))
    }

    pub fn primed(&self) -> Option<&PrimedAttention> {
        match self {
            Self::Primed(p) => Some(p),
            Self::Empty => None,
        }
    }
}

/// Результат одного шага внимания.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Объединённый контекст [B, att_odim].
    pub context: Tensor,
    /// Веса по головам, каждый [B, T].
    pub weights: Vec<Tensor>,
}

/// Многоголовое location-aware внимание.
#[derive(Debug, Clone)]
pub struct MultiHeadLocationAttention {
    heads: Vec<HeadParams>,
    mlp_o: Linear,
    dims: AttentionDims,
    padding: (usize, usize),
    mask_padding: bool,
}

impl MultiHeadLocationAttention {
    pub fn load(dims: AttentionDims, mask_padding: bool, vb: VarBuilder) -> Result<Self> {
        if dims.conv_kernel_size == 0 || dims.heads == 0 {
            bail!("Attention: kernel={} и heads={} должны быть > 0", dims.conv_kernel_size, dims.heads);
        }
        let heads = (0..dims.heads)
            .map(|h| {
                let h = h.to_string();
                let mlp_enc = candle_nn::linear(dims.encoder_dim, dims.att_dim, vb.pp("mlp_enc").pp(&h))?;
                let mlp_dec = candle_nn::linear_no_bias(dims.decoder_dim, dims.att_dim, vb.pp("mlp_dec").pp(&h))?;
                let mlp_att = candle_nn::linear_no_bias(dims.conv_channels, dims.att_dim, vb.pp("mlp_att").pp(&h))?;
                // Conv2d(1, C, (1, k)) в исходном state dict → ядро conv1d [C, 1, k]
                let loc_conv = vb
                    .pp("loc_conv")
                    .pp(&h)
                    .get((dims.conv_channels, 1, 1, dims.conv_kernel_size), "weight")?
                    .reshape((dims.conv_channels, 1, dims.conv_kernel_size))?;
                let gvec = candle_nn::linear_no_bias(dims.att_dim, 1, vb.pp("gvec").pp(&h))?;
                Ok(HeadParams {
                    mlp_enc,
                    mlp_dec,
                    mlp_att,
                    loc_conv,
                    gvec,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mlp_o = candle_nn::linear(dims.heads * dims.encoder_dim, dims.att_odim, vb.pp("mlp_o"))?;

        debug!(
            "Attention загружено: {} голов, att_dim={}, loc {}×{}, выход {}",
            dims.heads, dims.att_dim, dims.conv_channels, dims.conv_kernel_size, dims.att_odim
        );
        Ok(Self {
            heads,
            mlp_o,
            dims,
            padding: location_padding(dims.conv_kernel_size),
            mask_padding,
        })
    }

    pub fn dims(&self) -> AttentionDims {
        self.dims
    }

    /// Закэшировать энкодер и проекции `mlp_enc` по всем головам.
    pub fn prime(&self, enc: &PaddedSequence) -> Result<PrimedAttention> {
        let (_, time, dim) = enc.data().dims3()?;
        if dim != self.dims.encoder_dim {
            bail!(
                "Attention: вход энкодера {:?}, ожидалось {} признаков",
                enc.data().shape(),
                self.dims.encoder_dim
            );
        }
        let data = enc.data().contiguous()?;
        let projections = self
            .heads
            .iter()
            .map(|head| head.mlp_enc.forward(&data))
            .collect::<Result<Vec<_>>>()?;
        debug!("Attention: кэш энкодера {:?}, {} фреймов", data.shape(), time);
        Ok(PrimedAttention {
            enc: data,
            lens: enc.lens().to_vec(),
            projections,
            mask: enc.mask()?,
        })
    }

    /// Один шаг внимания.
    ///
    /// Пустое `state` заполняется из `enc`; заполненное используется как есть
    /// до [`AttentionState::reset`]. `dec_z = None` означает нулевое скрытое
    /// состояние, `prev = None` — равномерные веса по валидным фреймам.
    pub fn attend(
        &self,
        state: &mut AttentionState,
        enc: &PaddedSequence,
        dec_z: Option<&Tensor>,
        prev: Option<&[Tensor]>,
        scaling: f64,
    ) -> Result<AttentionOutput> {
        if let AttentionState::Empty = state {
            *state = AttentionState::Primed(self.prime(enc)?);
        }
        let AttentionState::Primed(cache) = state else {
            bail!("Attention: состояние не инициализировано");
        };

        let (batch, time, _) = cache.enc.dims3()?;
        let dtype = cache.enc.dtype();
        let device = cache.enc.device();

        let dec_z = match dec_z {
            Some(z) => {
                if z.dims() != [batch, self.dims.decoder_dim] {
                    bail!(
                        "Attention: состояние декодера {:?}, ожидалось [{batch}, {}]",
                        z.shape(),
                        self.dims.decoder_dim
                    );
                }
                z.clone()
            }
            None => Tensor::zeros((batch, self.dims.decoder_dim), dtype, device)?,
        };

        let prev = match prev {
            Some(ws) => {
                if ws.len() != self.heads.len() {
                    bail!("Attention: {} векторов весов на {} голов", ws.len(), self.heads.len());
                }
                if let Some(w) = ws.iter().find(|w| w.dims() != [batch, time]) {
                    bail!("Attention: предыдущие веса {:?}, ожидалось [{batch}, {time}]", w.shape());
                }
                ws.to_vec()
            }
            None => {
                let uniform = uniform_weights(&cache.lens, time, dtype, device)?;
                vec![uniform; self.heads.len()]
            }
        };

        let neg_inf = if self.mask_padding {
            Some(Tensor::full(f32::NEG_INFINITY, (batch, time), device)?.to_dtype(dtype)?)
        } else {
            None
        };

        let (pad_l, pad_r) = self.padding;
        let mut contexts = Vec::with_capacity(self.heads.len());
        let mut weights = Vec::with_capacity(self.heads.len());
        for (h, head) in self.heads.iter().enumerate() {
            // [B, T] → [B, 1, T + k - 1] → [B, C, T] → [B, T, C]
            let w_prev = prev[h].unsqueeze(1)?.pad_with_zeros(2, pad_l, pad_r)?;
            let loc = w_prev.conv1d(&head.loc_conv, 0, 1, 1, 1)?.transpose(1, 2)?;
            let loc = head.mlp_att.forward(&loc.contiguous()?)?;

            let dec = head.mlp_dec.forward(&dec_z)?.unsqueeze(1)?;
            let hidden = cache.projections[h].broadcast_add(&dec)?.add(&loc)?.tanh()?;
            let energy = (head.gvec.forward(&hidden)?.squeeze(2)? * scaling)?;

            let energy = match &neg_inf {
                Some(neg_inf) => cache.mask.where_cond(&energy, neg_inf)?,
                None => energy,
            };
            let w = candle_nn::ops::softmax(&energy, D::Minus1)?;

            // [B, 1, T] @ [B, T, D] → [B, D]
            let c = w.unsqueeze(1)?.matmul(&cache.enc)?.squeeze(1)?;
            contexts.push(c);
            weights.push(w);
        }

        let context = self.mlp_o.forward(&Tensor::cat(&contexts, D::Minus1)?)?;
        trace!("Attention: контекст {:?}", context.shape());
        Ok(AttentionOutput { context, weights })
    }
}

/// Сумма весов по времени для каждого высказывания: [B].
pub fn weight_mass(weights: &Tensor) -> Result<Vec<f32>> {
    weights.to_dtype(DType::F32)?.sum(D::Minus1)?.to_vec1()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn dims(kernel: usize) -> AttentionDims {
        AttentionDims {
            encoder_dim: 6,
            decoder_dim: 5,
            att_dim: 4,
            conv_channels: 3,
            conv_kernel_size: kernel,
            heads: 4,
            att_odim: 7,
        }
    }

    fn encoder_batch(device: &Device, lens: Vec<usize>, time: usize) -> PaddedSequence {
        let x = Tensor::randn(0f32, 1f32, (lens.len(), time, 6), device).unwrap();
        let mask = crate::sequence::length_mask(&lens, time, device)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .unsqueeze(2)
            .unwrap();
        PaddedSequence::new(x.broadcast_mul(&mask).unwrap(), lens).unwrap()
    }

    #[test]
    fn test_location_padding_split() {
        assert_eq!(location_padding(4), (2, 1));
        assert_eq!(location_padding(5), (2, 2));
        assert_eq!(location_padding(1), (0, 0));
        assert_eq!(location_padding(201), (100, 100));
    }

    #[test]
    fn test_weights_sum_to_one() {
        let device = Device::Cpu;
        for mask_padding in [true, false] {
            let (_varmap, vb) = make_vb(&device);
            let att = MultiHeadLocationAttention::load(dims(5), mask_padding, vb).unwrap();
            let enc = encoder_batch(&device, vec![10, 7, 5], 10);
            let z = Tensor::randn(0f32, 1f32, (3, 5), &device).unwrap();

            let mut state = AttentionState::new();
            let first = att.attend(&mut state, &enc, None, None, 1.0).unwrap();
            let second = att
                .attend(&mut state, &enc, Some(&z), Some(&first.weights), 1.0)
                .unwrap();

            assert_eq!(second.context.dims(), &[3, 7]);
            for out in [&first, &second] {
                assert_eq!(out.weights.len(), 4);
                for w in &out.weights {
                    assert_eq!(w.dims(), &[3, 10]);
                    for s in weight_mass(w).unwrap() {
                        assert!((s - 1.0).abs() < 1e-5, "sum={s}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_masked_padding_gets_zero_weight() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let att = MultiHeadLocationAttention::load(dims(3), true, vb).unwrap();
        let enc = encoder_batch(&device, vec![6, 2], 6);
        let mut state = AttentionState::new();
        let out = att.attend(&mut state, &enc, None, None, 1.0).unwrap();
        let rows: Vec<Vec<f32>> = out.weights[0].to_vec2().unwrap();
        assert!(rows[1][2..].iter().all(|&w| w == 0.0));
    }

    #[test]
    fn test_even_kernel_preserves_length() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let att = MultiHeadLocationAttention::load(dims(4), true, vb).unwrap();
        let enc = encoder_batch(&device, vec![9, 4], 9);
        let mut state = AttentionState::new();
        let out = att.attend(&mut state, &enc, None, None, 1.0).unwrap();
        for w in &out.weights {
            assert_eq!(w.dims(), &[2, 9]);
        }

        let head = &att.heads[0];
        let (l, r) = att.padding;
        let w = out.weights[0].unsqueeze(1).unwrap().pad_with_zeros(2, l, r).unwrap();
        let loc = w.conv1d(&head.loc_conv, 0, 1, 1, 1).unwrap();
        assert_eq!(loc.dims(), &[2, 3, 9]);
    }

    #[test]
    fn test_reset_recomputes_projections() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let att = MultiHeadLocationAttention::load(dims(3), true, vb).unwrap();
        let enc_a = encoder_batch(&device, vec![5, 3], 5);
        let enc_b = encoder_batch(&device, vec![5, 3], 5);

        let mut state = AttentionState::new();
        assert!(!state.is_primed());
        let a = att.attend(&mut state, &enc_a, None, None, 1.0).unwrap();
        assert!(state.is_primed());

        // без сброса кэш остаётся от первого энкодера
        let stale = att.attend(&mut state, &enc_b, None, None, 1.0).unwrap();
        let diff_stale = (&a.context - &stale.context)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff_stale, 0.0);

        state.reset();
        assert!(!state.is_primed());
        let fresh = att.attend(&mut state, &enc_b, None, None, 1.0).unwrap();
        let diff_fresh = (&a.context - &fresh.context)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff_fresh > 0.0);

        let primed = state.primed().unwrap();
        assert_eq!(primed.lens(), &[5, 3]);
        assert_eq!(primed.projections().len(), 4);
        for proj in primed.projections() {
            assert_eq!(proj.dims(), &[2, 5, 4]);
        }
        let same = (primed.encoder() - enc_b.data())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(same, 0.0);
    }

    #[test]
    fn test_rejects_wrong_head_count() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let att = MultiHeadLocationAttention::load(dims(3), true, vb).unwrap();
        let enc = encoder_batch(&device, vec![4], 4);
        let mut state = AttentionState::new();
        let w = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        assert!(att.attend(&mut state, &enc, None, Some(&[w]), 1.0).is_err());
    }
}
