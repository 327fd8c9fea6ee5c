//! Начальное состояние декодера из последнего фрейма энкодера.
//!
//! z0 = ReLU(fcz(h_last)), c0 = ReLU(fcc(h_last))
//!
//! Весовые ключи (`state_transform.*`): fcz.{weight,bias}, fcc.{weight,bias}.

use candle_core::{bail, Module, Result};
use candle_nn::{Linear, VarBuilder};

use crate::lstm::LstmState;
use crate::sequence::PaddedSequence;

#[derive(Debug, Clone)]
pub struct StateTransform {
    fcz: Linear,
    fcc: Linear,
    input_dim: usize,
}

impl StateTransform {
    pub fn load(input_dim: usize, output_dim: usize, vb: VarBuilder) -> Result<Self> {
        let fcz = candle_nn::linear(input_dim, output_dim, vb.pp("fcz"))?;
        let fcc = candle_nn::linear(input_dim, output_dim, vb.pp("fcc"))?;
        Ok(Self { fcz, fcc, input_dim })
    }

    /// Последний валидный фрейм каждого высказывания → (h, c) декодера.
    pub fn forward(&self, enc: &PaddedSequence) -> Result<LstmState> {
        let last = enc.last_valid()?;
        let (_, dim) = last.dims2()?;
        if dim != self.input_dim {
            bail!(
                "StateTransform: вход {:?}, ожидалось {} признаков",
                enc.data().shape(),
                self.input_dim
            );
        }
        let h = self.fcz.forward(&last)?.relu()?;
        let c = self.fcc.forward(&last)?.relu()?;
        Ok(LstmState::new(h, c))
    }
}
