//! Энкодер: VGG2L → пирамидальный BLSTM.
//!
//! Весовые ключи (`encoder.*`):
//! - enc1.*: свёрточный редуктор (см. [`crate::vgg`])
//! - enc2.layers.{i}.{weight,bias}_{ih,hh}_l0[_reverse]

use candle_core::{bail, ModuleT, Result};
use candle_nn::{Dropout, VarBuilder};
use tracing::debug;

use crate::config::LasConfig;
use crate::lstm::BiLstm;
use crate::sequence::PaddedSequence;
use crate::vgg::Vgg2l;

/// Стек BLSTM с прореживанием по времени после выбранных слоёв.
#[derive(Debug, Clone)]
pub struct PyramidalBlstm {
    layers: Vec<BiLstm>,
    dropout: Dropout,
    subsample: Vec<usize>,
}

impl PyramidalBlstm {
    pub fn load(
        input_dim: usize,
        hidden_dim: usize,
        subsample: &[usize],
        dropout_rate: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb_layers = vb.pp("layers");
        let layers = (0..subsample.len())
            .map(|i| {
                let idim = if i == 0 { input_dim } else { hidden_dim * 2 };
                BiLstm::load(idim, hidden_dim, vb_layers.pp(i.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            dropout: Dropout::new(dropout_rate),
            subsample: subsample.to_vec(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Прогон стека. Dropout активен только при `train = true`.
    pub fn forward_t(&self, xs: &PaddedSequence, train: bool) -> Result<PaddedSequence> {
        let mut xs = xs.clone();
        for (i, (layer, &sub)) in self.layers.iter().zip(&self.subsample).enumerate() {
            let out = layer.forward(&xs)?;
            let dropped = self.dropout.forward_t(out.data(), train)?;
            let out = out.with_data(dropped)?;

            let (data, lens) = out.subsample(sub)?;
            if lens.iter().any(|&l| l == 0) {
                bail!(
                    "pBLSTM: слой {i} с прореживанием {sub} обнулил длину (длины {:?} → {:?}, тензор {:?})",
                    out.lens(),
                    lens,
                    data.shape()
                );
            }
            debug!("pBLSTM слой {i}: {:?}, длины {:?}", data.shape(), lens);
            xs = PaddedSequence::new(data, lens)?;
        }
        Ok(xs)
    }
}

/// Акустический энкодер целиком.
#[derive(Debug, Clone)]
pub struct Encoder {
    enc1: Vgg2l,
    enc2: PyramidalBlstm,
    output_dim: usize,
}

impl Encoder {
    pub fn load(config: &LasConfig, vb: VarBuilder) -> Result<Self> {
        let enc1 = Vgg2l::load(config.in_channel, vb.pp("enc1"))?;
        let enc2 = PyramidalBlstm::load(
            config.vgg_output_dim(),
            config.enc_hidden_dim,
            &config.subsample,
            config.dropout_rate,
            vb.pp("enc2"),
        )?;
        debug!(
            "Encoder загружен: VGG2L({} → {}), pBLSTM {} слоёв × {}, subsample {:?}",
            config.input_dim,
            config.vgg_output_dim(),
            enc2.num_layers(),
            config.enc_hidden_dim,
            config.subsample
        );
        Ok(Self {
            enc1,
            enc2,
            output_dim: config.encoder_dim(),
        })
    }

    /// Размерность выхода (два направления BLSTM).
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// [B, T, D] + длины → [B, T', 2*hidden] + длины.
    pub fn forward_t(&self, xs: &PaddedSequence, train: bool) -> Result<PaddedSequence> {
        let reduced = self.enc1.forward(xs)?;
        let encoded = self.enc2.forward_t(&reduced, train)?;
        let (_, _, d) = encoded.data().dims3()?;
        if d != self.output_dim {
            bail!("Encoder: выход {:?}, ожидалось {} признаков", encoded.data().shape(), self.output_dim);
        }
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_pblstm_subsample_lengths() {
        let device = Device::Cpu;
        for s in [1usize, 2, 3] {
            for l in 1..=10usize {
                let (_varmap, vb) = make_vb(&device);
                let blstm = PyramidalBlstm::load(3, 2, &[s], 0.0, vb).unwrap();
                let x = Tensor::randn(0f32, 1f32, (1, l, 3), &device).unwrap();
                let out = blstm.forward_t(&PaddedSequence::new(x, vec![l]).unwrap(), false);
                let expected = if s > 1 { (l + 1) / s } else { l };
                if expected == 0 {
                    assert!(out.is_err(), "s={s}, L={l}");
                    continue;
                }
                let out = out.unwrap();
                assert_eq!(out.lens(), &[expected], "s={s}, L={l}");
                assert!(out.max_time().unwrap() >= expected);
            }
        }
    }

    #[test]
    fn test_pblstm_stack_shapes() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let blstm = PyramidalBlstm::load(6, 4, &[1, 2, 1], 0.3, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 9, 6), &device).unwrap();
        let out = blstm
            .forward_t(&PaddedSequence::new(x, vec![9, 6]).unwrap(), false)
            .unwrap();
        assert_eq!(out.lens(), &[5, 3]);
        assert_eq!(out.data().dims(), &[2, 5, 8]);
    }

    fn abs_diff(a: &PaddedSequence, b: &PaddedSequence) -> f32 {
        (a.data() - b.data())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_dropout_only_in_training() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let blstm = PyramidalBlstm::load(3, 4, &[1], 0.5, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 6, 3), &device).unwrap();
        let xs = PaddedSequence::new(x, vec![6, 4]).unwrap();

        let eval_a = blstm.forward_t(&xs, false).unwrap();
        let eval_b = blstm.forward_t(&xs, false).unwrap();
        assert_eq!(abs_diff(&eval_a, &eval_b), 0.0);

        let train = blstm.forward_t(&xs, true).unwrap();
        assert_eq!(train.lens(), eval_a.lens());
        assert!(abs_diff(&train, &eval_a) > 0.0);
    }

    #[test]
    fn test_encoder_output() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let config = LasConfig {
            input_dim: 40,
            enc_hidden_dim: 4,
            enc_n_layers: 2,
            subsample: vec![1, 2],
            ..LasConfig::wsj()
        };
        let encoder = Encoder::load(&config, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 12, 40), &device).unwrap();
        let out = encoder
            .forward_t(&PaddedSequence::new(x, vec![12, 8]).unwrap(), false)
            .unwrap();
        // 12 → 3 → 2, 8 → 2 → 1
        assert_eq!(out.lens(), &[2, 1]);
        assert_eq!(out.data().dims(), &[2, 2, 8]);
    }
}
