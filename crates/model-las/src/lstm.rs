//! LSTM-ячейка и двунаправленный слой поверх упакованных последовательностей.
//!
//! Весовые ключи совпадают с PyTorch:
//! - `nn.LSTM`: `weight_ih_l0`, `weight_hh_l0`, `bias_ih_l0`, `bias_hh_l0`
//!   (+ суффикс `_reverse` для обратного направления)
//! - `nn.LSTMCell`: `weight_ih`, `weight_hh`, `bias_ih`, `bias_hh`

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};
use tracing::debug;

use crate::sequence::{PackedSequence, PaddedSequence};

/// Состояние ячейки: (h, c), каждое `[batch, hidden]`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

impl LstmState {
    pub fn new(h: Tensor, c: Tensor) -> Self {
        Self { h, c }
    }

    /// Нулевое состояние на `batch` высказываний.
    pub fn zeros(batch: usize, hidden: usize, like: &Tensor) -> Result<Self> {
        let z = Tensor::zeros((batch, hidden), like.dtype(), like.device())?;
        Ok(Self { h: z.clone(), c: z })
    }

    /// Оставить первые `n` строк (высказывания, которые ещё активны).
    fn narrow(&self, n: usize) -> Result<Self> {
        if n == self.h.dim(0)? {
            return Ok(self.clone());
        }
        Ok(Self {
            h: self.h.narrow(0, 0, n)?,
            c: self.c.narrow(0, 0, n)?,
        })
    }

    /// Дописать нулевые строки до `n` (высказывания, которые стартуют на этом шаге).
    fn grow(&self, n: usize) -> Result<Self> {
        let extra = n - self.h.dim(0)?;
        Ok(Self {
            h: self.h.pad_with_zeros(0, 0, extra)?,
            c: self.c.pad_with_zeros(0, 0, extra)?,
        })
    }
}

/// Одна LSTM-ячейка.
///
/// gates = x @ W_ih^T + b_ih + h @ W_hh^T + b_hh
/// i, f, g, o = gates.chunk(4)
/// c = sigmoid(f) * c_prev + sigmoid(i) * tanh(g)
/// h = sigmoid(o) * tanh(c)
#[derive(Debug, Clone)]
pub struct LstmCell {
    weight_ih: Tensor, // [4*hidden, input_size]
    weight_hh: Tensor, // [4*hidden, hidden_size]
    bias_ih: Tensor,   // [4*hidden]
    bias_hh: Tensor,   // [4*hidden]
    hidden_size: usize,
}

impl LstmCell {
    /// Загрузить веса с заданным суффиксом ключей (`""`, `"_l0"`, `"_l0_reverse"`).
    pub fn load(input_size: usize, hidden_size: usize, suffix: &str, vb: VarBuilder) -> Result<Self> {
        let gate_size = 4 * hidden_size;
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight_ih = vb.get_with_hints((gate_size, input_size), &format!("weight_ih{suffix}"), init)?;
        let weight_hh = vb.get_with_hints((gate_size, hidden_size), &format!("weight_hh{suffix}"), init)?;
        let bias_ih = vb.get_with_hints(gate_size, &format!("bias_ih{suffix}"), init)?;
        let bias_hh = vb.get_with_hints(gate_size, &format!("bias_hh{suffix}"), init)?;
        Ok(Self {
            weight_ih,
            weight_hh,
            bias_ih,
            bias_hh,
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn input_size(&self) -> Result<usize> {
        self.weight_ih.dim(1)
    }

    /// Один шаг: x `[batch, input]`, state `[batch, hidden]` → новое состояние.
    pub fn step(&self, x: &Tensor, state: &LstmState) -> Result<LstmState> {
        let gates = x
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias_ih)?
            .broadcast_add(&state.h.matmul(&self.weight_hh.t()?)?)?
            .broadcast_add(&self.bias_hh)?;

        let hs = self.hidden_size;
        let i_gate = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, 0, hs)?)?;
        let f_gate = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, hs, hs)?)?;
        let g_gate = gates.narrow(D::Minus1, 2 * hs, hs)?.tanh()?;
        let o_gate = candle_nn::ops::sigmoid(&gates.narrow(D::Minus1, 3 * hs, hs)?)?;

        let c = ((f_gate * &state.c)? + (i_gate * g_gate)?)?;
        let h = (o_gate * c.tanh()?)?;
        Ok(LstmState { h, c })
    }
}

/// Однослойный двунаправленный LSTM (`nn.LSTM(bidirectional=True)`).
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: LstmCell,
    backward: LstmCell,
}

impl BiLstm {
    pub fn load(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let forward = LstmCell::load(input_size, hidden_size, "_l0", vb.clone())?;
        let backward = LstmCell::load(input_size, hidden_size, "_l0_reverse", vb)?;
        Ok(Self { forward, backward })
    }

    /// Размерность выхода: конкатенация двух направлений.
    pub fn output_size(&self) -> usize {
        2 * self.forward.hidden_size()
    }

    /// Прогнать батч: упаковка по длинам → оба направления → распаковка.
    ///
    /// Выход `[batch, max_len, 2*hidden]`, дополненные фреймы нулевые.
    pub fn forward(&self, xs: &PaddedSequence) -> Result<PaddedSequence> {
        let (_, _, input) = xs.data().dims3()?;
        let expected = self.forward.input_size()?;
        if input != expected {
            candle_core::bail!(
                "BiLstm: размерность входа {input}, ожидалось {expected} (тензор {:?})",
                xs.data().shape()
            );
        }

        let packed = xs.pack()?;
        let fwd = self.run_forward(&packed)?;
        let bwd = self.run_backward(&packed)?;
        let outputs = fwd
            .into_iter()
            .zip(bwd)
            .map(|(f, b)| Tensor::cat(&[f, b], D::Minus1))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "BiLstm: {} шагов, batch_sizes={:?}",
            packed.steps().len(),
            packed.batch_sizes()
        );
        packed.unpack(outputs)
    }

    /// Прямое направление: активный префикс батча только сужается, состояние
    /// закончившихся высказываний просто отбрасывается.
    fn run_forward(&self, packed: &PackedSequence) -> Result<Vec<Tensor>> {
        let steps = packed.steps();
        let mut state = LstmState::zeros(packed.batch_sizes()[0], self.forward.hidden_size(), &steps[0])?;
        let mut outputs = Vec::with_capacity(steps.len());
        for (x, &active) in steps.iter().zip(packed.batch_sizes()) {
            state = self.forward.step(x, &state.narrow(active)?)?;
            outputs.push(state.h.clone());
        }
        Ok(outputs)
    }

    /// Обратное направление: идём с конца, каждое высказывание стартует с нуля
    /// на своём последнем валидном фрейме.
    fn run_backward(&self, packed: &PackedSequence) -> Result<Vec<Tensor>> {
        let steps = packed.steps();
        let hidden = self.backward.hidden_size();
        let mut outputs = vec![None; steps.len()];
        let mut state: Option<LstmState> = None;
        for t in (0..steps.len()).rev() {
            let active = packed.batch_sizes()[t];
            let prev = match state {
                Some(s) if s.h.dim(0)? < active => s.grow(active)?,
                Some(s) => s,
                None => LstmState::zeros(active, hidden, &steps[t])?,
            };
            let next = self.backward.step(&steps[t], &prev)?;
            outputs[t] = Some(next.h.clone());
            state = Some(next);
        }
        outputs
            .into_iter()
            .map(|o| o.ok_or_else(|| candle_core::Error::Msg("BiLstm: пропущен шаг".into())))
            .collect()
    }
}
