//! Дополненные и упакованные последовательности.
//!
//! [`PaddedSequence`] держит дополненный тензор `[batch, time, dim]` вместе
//! с вектором длин, чтобы длины пересчитывались в том же месте, где
//! сокращается время. [`PackedSequence`] раскладывает батч по шагам времени
//! так, что на шаге `t` остаются только высказывания длиннее `t`:
//! рекуррентный слой не видит дополнение и не протаскивает через него
//! состояние.
//!
//! Упаковка опирается на сортировку батча по убыванию длины: активные
//! высказывания на каждом шаге образуют префикс батча.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Длина после пулинга с ceil-округлением: `ceil(len / factor)`.
pub fn pooled_length(len: usize, factor: usize) -> usize {
    len.div_ceil(factor)
}

/// Длина после прореживания каждого `factor`-го фрейма: `(len + 1) / factor`.
///
/// При `factor <= 1` длина не меняется.
pub fn subsampled_length(len: usize, factor: usize) -> usize {
    if factor > 1 {
        (len + 1) / factor
    } else {
        len
    }
}

/// Дополненный батч с валидными длинами.
#[derive(Debug, Clone)]
pub struct PaddedSequence {
    data: Tensor,
    lens: Vec<usize>,
}

impl PaddedSequence {
    /// Создать с проверкой: `lens.len() == batch`, длины в `1..=time`,
    /// порядок не возрастает.
    pub fn new(data: Tensor, lens: Vec<usize>) -> Result<Self> {
        let (batch, time, _) = data.dims3()?;
        if batch == 0 {
            bail!("пустой батч (тензор {:?})", data.shape());
        }
        if lens.len() != batch {
            bail!(
                "вектор длин {:?} не совпадает с размером батча {batch} (тензор {:?})",
                lens,
                data.shape()
            );
        }
        if let Some(&bad) = lens.iter().find(|&&l| l == 0 || l > time) {
            bail!(
                "длина {bad} вне 1..={time} (длины {:?}, тензор {:?})",
                lens,
                data.shape()
            );
        }
        if lens.windows(2).any(|w| w[0] < w[1]) {
            bail!("длины должны идти по убыванию для упаковки: {:?}", lens);
        }
        Ok(Self { data, lens })
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn batch_size(&self) -> usize {
        self.lens.len()
    }

    /// Дополненная длина по времени.
    pub fn max_time(&self) -> Result<usize> {
        self.data.dim(1)
    }

    pub fn device(&self) -> &Device {
        self.data.device()
    }

    pub fn into_parts(self) -> (Tensor, Vec<usize>) {
        (self.data, self.lens)
    }

    /// Заменить данные, сохранив длины (например, после dropout).
    pub fn with_data(self, data: Tensor) -> Result<Self> {
        Self::new(data, self.lens)
    }

    /// Упаковать: для каждого шага `t` срез `[batch_sizes[t], dim]`.
    ///
    /// Количество шагов равно максимальной длине, а не дополненной.
    pub fn pack(&self) -> Result<PackedSequence> {
        let steps_total = self.lens[0];
        let mut steps = Vec::with_capacity(steps_total);
        let mut batch_sizes = Vec::with_capacity(steps_total);
        for t in 0..steps_total {
            let active = self.lens.iter().take_while(|&&l| l > t).count();
            let step = self.data.narrow(1, t, 1)?.squeeze(1)?.narrow(0, 0, active)?;
            steps.push(step);
            batch_sizes.push(active);
        }
        Ok(PackedSequence {
            steps,
            batch_sizes,
            batch: self.batch_size(),
        })
    }

    /// Оставить каждый `factor`-й фрейм, начиная с нулевого, и пересчитать длины.
    ///
    /// Длины дополнительно обрезаются до фактически оставшейся протяжённости.
    /// Результат может содержать нулевые длины, поэтому возвращается как
    /// пара (тензор, длины), а не как проверенная последовательность.
    pub fn subsample(&self, factor: usize) -> Result<(Tensor, Vec<usize>)> {
        if factor <= 1 {
            return Ok((self.data.clone(), self.lens.clone()));
        }
        let time = self.max_time()?;
        let idx = Tensor::arange_step(0u32, time as u32, factor as u32, self.device())?;
        let kept = idx.dim(0)?;
        let data = self.data.index_select(&idx, 1)?;
        let lens = self
            .lens
            .iter()
            .map(|&l| subsampled_length(l, factor).min(kept))
            .collect();
        Ok((data, lens))
    }

    /// Маска валидных фреймов `[batch, time]` (u8).
    pub fn mask(&self) -> Result<Tensor> {
        length_mask(&self.lens, self.max_time()?, self.device())
    }

    /// Последний валидный фрейм каждого высказывания: `[batch, dim]`.
    pub fn last_valid(&self) -> Result<Tensor> {
        let rows = self
            .lens
            .iter()
            .enumerate()
            .map(|(b, &l)| self.data.get(b)?.get(l - 1))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&rows, 0)
    }
}

/// Маска `[batch, time]`: 1 для `t < len`, 0 для дополнения.
pub fn length_mask(lens: &[usize], time: usize, device: &Device) -> Result<Tensor> {
    let mut mask = vec![0u8; lens.len() * time];
    for (b, &l) in lens.iter().enumerate() {
        for m in &mut mask[b * time..b * time + l.min(time)] {
            *m = 1;
        }
    }
    Tensor::from_vec(mask, (lens.len(), time), device)
}

/// Батч, разложенный по шагам времени без дополнения.
#[derive(Debug, Clone)]
pub struct PackedSequence {
    steps: Vec<Tensor>,
    batch_sizes: Vec<usize>,
    batch: usize,
}

impl PackedSequence {
    pub fn steps(&self) -> &[Tensor] {
        &self.steps
    }

    /// Количество активных высказываний на каждом шаге (не возрастает).
    pub fn batch_sizes(&self) -> &[usize] {
        &self.batch_sizes
    }

    /// Собрать обратно из выходов рекуррентного слоя (по одному `[batch_sizes[t], dim]`
    /// на шаг). Хвосты заполняются нулями.
    pub fn unpack(&self, outputs: Vec<Tensor>) -> Result<PaddedSequence> {
        if outputs.len() != self.steps.len() {
            bail!(
                "распаковка: {} выходов на {} шагов",
                outputs.len(),
                self.steps.len()
            );
        }
        let padded = outputs
            .into_iter()
            .zip(&self.batch_sizes)
            .map(|(out, &active)| {
                if out.dim(0)? != active {
                    bail!("распаковка: выход {:?} при {active} активных", out.shape());
                }
                out.pad_with_zeros(0, 0, self.batch - active)
            })
            .collect::<Result<Vec<_>>>()?;
        let data = Tensor::stack(&padded, 1)?;
        let lens = (0..self.batch)
            .map(|b| self.batch_sizes.iter().filter(|&&n| n > b).count())
            .collect();
        PaddedSequence::new(data, lens)
    }
}

/// Равномерное распределение по валидным фреймам: `1/len` до длины, 0 после.
pub fn uniform_weights(lens: &[usize], time: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut w = vec![0f32; lens.len() * time];
    for (b, &l) in lens.iter().enumerate() {
        let l = l.min(time);
        for v in &mut w[b * time..b * time + l] {
            *v = 1.0 / l as f32;
        }
    }
    Tensor::from_vec(w, (lens.len(), time), device)?.to_dtype(dtype)
}
