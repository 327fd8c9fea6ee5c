//! Общие типы для подготовки батча.
//!
//! Препроцессинг (извлечение признаков, разбор архивов и словарей) живёт
//! снаружи и отдаёт нам тройки (признаки, длина, токены). Здесь они
//! собираются в один дополненный тензор, отсортированный по убыванию длины:
//! рекуррентный энкодер упаковывает батч по длинам и требует этот порядок.

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{AsrError, AsrResult};

// ---------------------------------------------------------------------------
// Высказывание
// ---------------------------------------------------------------------------

/// Одно высказывание: матрица признаков и последовательность token ID.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Идентификатор высказывания.
    pub id: String,

    /// Признаки построчно, `num_frames * feat_dim` значений.
    pub features: Vec<f32>,

    /// Размерность признаков на фрейм.
    pub feat_dim: usize,

    /// Целевые token ID (без `<BOS>`/`<EOS>`), может быть пустым при инференсе.
    pub tokens: Vec<u32>,
}

impl Utterance {
    /// Создать высказывание, проверив согласованность размеров.
    pub fn new(
        id: impl Into<String>,
        features: Vec<f32>,
        feat_dim: usize,
        tokens: Vec<u32>,
    ) -> AsrResult<Self> {
        let id = id.into();
        if feat_dim == 0 || features.len() % feat_dim != 0 {
            return Err(AsrError::Shape(format!(
                "{id}: {} значений признаков не делятся на feat_dim={feat_dim}",
                features.len()
            )));
        }
        Ok(Self {
            id,
            features,
            feat_dim,
            tokens,
        })
    }

    /// Количество фреймов.
    pub fn num_frames(&self) -> usize {
        self.features.len() / self.feat_dim
    }
}

// ---------------------------------------------------------------------------
// Батч
// ---------------------------------------------------------------------------

/// Собранный батч, упорядоченный по убыванию длины.
#[derive(Debug, Clone)]
pub struct FeatureBatch {
    /// Идентификаторы в порядке батча.
    pub ids: Vec<String>,

    /// Тензор формы [batch, max_frames, feat_dim], хвосты заполнены нулями.
    pub features: Tensor,

    /// Валидная длина каждого высказывания.
    pub lengths: Vec<usize>,

    /// Целевые последовательности в порядке батча.
    pub targets: Vec<Vec<u32>>,
}

impl FeatureBatch {
    /// Размер батча.
    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    /// Длина самого длинного высказывания.
    pub fn max_frames(&self) -> usize {
        self.lengths.first().copied().unwrap_or(0)
    }
}

/// Собрать батч: сортировка по убыванию длины + дополнение нулями.
///
/// Сортировка стабильная, поэтому высказывания одинаковой длины сохраняют
/// исходный порядок.
pub fn collate(mut utterances: Vec<Utterance>, device: &Device) -> AsrResult<FeatureBatch> {
    let Some(first) = utterances.first() else {
        return Err(AsrError::InvalidInput("пустой батч".into()));
    };
    let feat_dim = first.feat_dim;

    for utt in &utterances {
        if utt.feat_dim != feat_dim {
            return Err(AsrError::Shape(format!(
                "{}: feat_dim={} не совпадает с {feat_dim}",
                utt.id, utt.feat_dim
            )));
        }
        if utt.num_frames() == 0 {
            return Err(AsrError::InvalidInput(format!(
                "{}: высказывание без фреймов",
                utt.id
            )));
        }
    }

    utterances.sort_by(|a, b| b.num_frames().cmp(&a.num_frames()));

    let batch = utterances.len();
    let max_frames = utterances[0].num_frames();
    let row = max_frames * feat_dim;

    let mut buf = vec![0f32; batch * row];
    let mut ids = Vec::with_capacity(batch);
    let mut lengths = Vec::with_capacity(batch);
    let mut targets = Vec::with_capacity(batch);

    for (b, utt) in utterances.into_iter().enumerate() {
        let offset = b * row;
        buf[offset..offset + utt.features.len()].copy_from_slice(&utt.features);
        lengths.push(utt.num_frames());
        ids.push(utt.id);
        targets.push(utt.tokens);
    }

    let features = Tensor::from_vec(buf, (batch, max_frames, feat_dim), device)?;
    debug!(
        "Батч собран: {} высказываний, max_frames={}, feat_dim={}",
        batch, max_frames, feat_dim
    );

    Ok(FeatureBatch {
        ids,
        features,
        lengths,
        targets,
    })
}

/// Дополнить рваные последовательности до общей длины значением `pad`.
pub fn pad_list(seqs: &[Vec<u32>], pad: u32) -> Vec<Vec<u32>> {
    let max_len = seqs.iter().map(Vec::len).max().unwrap_or(0);
    seqs.iter()
        .map(|s| {
            let mut padded = s.clone();
            padded.resize(max_len, pad);
            padded
        })
        .collect()
}
