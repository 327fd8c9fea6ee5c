//! VGG2L: двухблочный свёрточный редуктор признаков.
//!
//! Каждый блок: Conv2d 3×3 → ReLU → Conv2d 3×3 → ReLU → MaxPool 2×2 (ceil).
//! Время и частота сокращаются в 4 раза, на выходе 128 каналов.
//!
//! Весовые ключи (`encoder.enc1.*`):
//! - conv1_1: [64, in_channel, 3, 3], conv1_2: [64, 64, 3, 3]
//! - conv2_1: [128, 64, 3, 3],        conv2_2: [128, 128, 3, 3]

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use tracing::debug;

use crate::config::VGG_OUT_CHANNELS;
use crate::sequence::{pooled_length, PaddedSequence};

const POOL: usize = 2;

/// MaxPool 2×2 со stride 2 и ceil-округлением выходного размера.
///
/// Нечётные оси дополняются повтором последнего элемента: для максимума это
/// то же самое, что частичное окно на краю.
fn max_pool2d_ceil(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let x = if h % POOL != 0 {
        x.pad_with_same(2, 0, POOL - h % POOL)?
    } else {
        x.clone()
    };
    let x = if w % POOL != 0 {
        x.pad_with_same(3, 0, POOL - w % POOL)?
    } else {
        x
    };
    x.max_pool2d(POOL)
}

/// Сверточный редуктор VGG2L.
#[derive(Debug, Clone)]
pub struct Vgg2l {
    conv1_1: Conv2d,
    conv1_2: Conv2d,
    conv2_1: Conv2d,
    conv2_2: Conv2d,
    in_channel: usize,
}

impl Vgg2l {
    pub fn load(in_channel: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1_1 = candle_nn::conv2d(in_channel, 64, 3, cfg, vb.pp("conv1_1"))?;
        let conv1_2 = candle_nn::conv2d(64, 64, 3, cfg, vb.pp("conv1_2"))?;
        let conv2_1 = candle_nn::conv2d(64, VGG_OUT_CHANNELS, 3, cfg, vb.pp("conv2_1"))?;
        let conv2_2 = candle_nn::conv2d(VGG_OUT_CHANNELS, VGG_OUT_CHANNELS, 3, cfg, vb.pp("conv2_2"))?;
        Ok(Self {
            conv1_1,
            conv1_2,
            conv2_1,
            conv2_2,
            in_channel,
        })
    }

    fn conv_block(x: &Tensor, layers: [&Conv2d; 2]) -> Result<Tensor> {
        let mut out = x.clone();
        for layer in layers {
            out = layer.forward(&out)?.relu()?;
        }
        max_pool2d_ceil(&out)
    }

    /// Forward: [B, T, D] → [B, ceil(ceil(T/2)/2), 128 * ceil(ceil(D/in_channel/2)/2)].
    ///
    /// Длины пересчитываются как `ceil(len/2)` после каждого блока.
    pub fn forward(&self, xs: &PaddedSequence) -> Result<PaddedSequence> {
        let (b, t, d) = xs.data().dims3()?;
        if d % self.in_channel != 0 {
            bail!(
                "VGG2L: размерность признаков {d} не делится на in_channel={} (тензор {:?})",
                self.in_channel,
                xs.data().shape()
            );
        }

        // [B, T, D] → [B, T, C, D/C] → [B, C, T, D/C]
        let x = xs
            .data()
            .reshape((b, t, self.in_channel, d / self.in_channel))?
            .transpose(1, 2)?
            .contiguous()?;

        let x = Self::conv_block(&x, [&self.conv1_1, &self.conv1_2])?;
        let x = Self::conv_block(&x, [&self.conv2_1, &self.conv2_2])?;

        // [B, C, T', F'] → [B, T', C, F'] → [B, T', C*F']
        let (_, c, t_out, f_out) = x.dims4()?;
        let x = x.transpose(1, 2)?.contiguous()?.reshape((b, t_out, c * f_out))?;

        let expected = pooled_length(pooled_length(t, POOL), POOL);
        if t_out != expected {
            bail!("VGG2L: выход по времени {t_out}, ожидалось ceil(ceil({t}/2)/2)={expected}");
        }

        let lens = xs
            .lens()
            .iter()
            .map(|&l| pooled_length(pooled_length(l, POOL), POOL))
            .collect();

        debug!("VGG2L: {:?} → {:?}", xs.data().shape(), x.shape());
        PaddedSequence::new(x, lens)
    }
}
