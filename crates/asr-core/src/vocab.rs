//! Словарь выходных токенов (символы или BPE-юниты).
//!
//! Раскладка ID фиксирована: `0=<PAD>`, `1=<BOS>`, `2=<EOS>`, дальше
//! контентные токены. Сырые метки корпуса начинаются с 2 (0 и 1 заняты
//! `<blank>`/`<unk>` в исходном словаре) и сдвигаются на [`RAW_ID_SHIFT`].

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{AsrError, AsrResult};

/// ID токена дополнения.
pub const PAD_ID: u32 = 0;
/// ID токена начала последовательности.
pub const BOS_ID: u32 = 1;
/// ID токена конца последовательности.
pub const EOS_ID: u32 = 2;

/// Первый сырой ID корпуса, который попадает в словарь.
const FIRST_RAW_ID: u32 = 2;
/// Сдвиг сырых меток: `new = raw - 2 + 3`.
pub const RAW_ID_SHIFT: u32 = 1;

const RESERVED: [&str; 3] = ["<PAD>", "<BOS>", "<EOS>"];
const SPACE_SYMBOL: &str = "<space>";

/// Двунаправленный словарь token ↔ ID.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    id_to_token: Vec<String>,
    token_to_id: HashMap<String, u32>,
    non_lang_syms: HashSet<String>,
}

impl Vocabulary {
    /// Построить словарь из пар (символ, сырой ID корпуса).
    ///
    /// Записи с сырыми ID ниже 2 (`<blank>`/`<unk>` исходного словаря)
    /// пропускаются.
    pub fn from_raw_entries<I, S>(entries: I) -> AsrResult<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let shifted: Vec<(String, u32)> = entries
            .into_iter()
            .filter_map(|(sym, raw)| {
                let sym = sym.into();
                if raw < FIRST_RAW_ID {
                    debug!("пропущен зарезервированный сырой ID {raw} ('{sym}')");
                    return None;
                }
                Some((sym, raw.saturating_add(RAW_ID_SHIFT)))
            })
            .collect();
        Self::from_entries(shifted)
    }

    /// Построить словарь из уже сдвинутых пар (символ, ID).
    ///
    /// Зарезервированные токены добавляются автоматически; ID контентных
    /// токенов должны быть уникальны, не пересекаться с ними и плотно
    /// занимать диапазон `3..3 + n`.
    pub fn from_entries<I, S>(entries: I) -> AsrResult<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let content: Vec<(String, u32)> = entries
            .into_iter()
            .map(|(sym, id)| (sym.into(), id))
            .filter(|(sym, _)| !RESERVED.contains(&sym.as_str()))
            .collect();
        let size = content.len() + RESERVED.len();

        let mut token_to_id: HashMap<String, u32> = RESERVED
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();
        let mut id_to_token = vec![String::new(); size];
        for (i, s) in RESERVED.iter().enumerate() {
            id_to_token[i] = s.to_string();
        }

        for (sym, id) in content {
            if id <= EOS_ID {
                return Err(AsrError::InvalidInput(format!(
                    "ID {id} для '{sym}' пересекается с зарезервированными"
                )));
            }
            if id as usize >= size {
                return Err(AsrError::InvalidInput(format!(
                    "ID {id} для '{sym}' вне диапазона [3, {size}): ID должны идти подряд"
                )));
            }
            let slot = &mut id_to_token[id as usize];
            if !slot.is_empty() {
                return Err(AsrError::InvalidInput(format!(
                    "ID {id} назначен и '{slot}', и '{sym}'"
                )));
            }
            if token_to_id.insert(sym.clone(), id).is_some() {
                return Err(AsrError::InvalidInput(format!("символ '{sym}' повторяется")));
            }
            *slot = sym;
        }

        Ok(Self {
            id_to_token,
            token_to_id,
            non_lang_syms: HashSet::new(),
        })
    }

    /// Загрузить словарь из JSON-объекта `{"token": id, ...}` (ID уже сдвинуты).
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let map: HashMap<String, u32> = serde_json::from_str(&data)?;
        let vocab = Self::from_entries(map)?;
        info!("Словарь загружен из {:?}: {} токенов", path, vocab.len());
        Ok(vocab)
    }

    /// Задать нелингвистические символы (шум, паузы и т.п.), которые
    /// выбрасываются при сборке текста.
    pub fn with_non_lang_syms<I, S>(mut self, syms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_lang_syms = syms.into_iter().map(Into::into).collect();
        self
    }

    /// Размер словаря (включая зарезервированные ID).
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= RESERVED.len()
    }

    /// Количество контентных токенов (то, что модель называет `output_dim`).
    pub fn output_dim(&self) -> usize {
        self.len() - RESERVED.len()
    }

    /// ID символа.
    pub fn id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Символ по ID.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.id_to_token
            .get(id as usize)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Сдвинуть сырые метки корпуса в пространство ID модели.
    pub fn shift_raw_ids(raw: &[u32]) -> AsrResult<Vec<u32>> {
        raw.iter()
            .map(|&r| {
                if r < FIRST_RAW_ID {
                    return Err(AsrError::InvalidInput(format!("сырой ID {r} зарезервирован")));
                }
                r.checked_add(RAW_ID_SHIFT)
                    .ok_or_else(|| AsrError::InvalidInput(format!("сырой ID {r} вне диапазона")))
            })
            .collect()
    }

    /// Собрать текст из последовательности ID.
    ///
    /// Останавливается на первом `<EOS>`, пропускает `<PAD>`/`<BOS>`,
    /// нелингвистические символы и неизвестные ID.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut text = String::new();
        for &id in ids {
            match id {
                EOS_ID => break,
                PAD_ID | BOS_ID => continue,
                _ => {}
            }
            let Some(tok) = self.token(id) else {
                continue;
            };
            if self.non_lang_syms.contains(tok) {
                continue;
            }
            if tok == SPACE_SYMBOL {
                text.push(' ');
            } else {
                text.push_str(tok);
            }
        }
        text.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars() -> Vocabulary {
        Vocabulary::from_raw_entries([("<space>", 2), ("a", 3), ("b", 4), ("<NOISE>", 5)])
            .unwrap()
            .with_non_lang_syms(["<NOISE>"])
    }

    #[test]
    fn test_reserved_ids() {
        let vocab = chars();
        assert_eq!(vocab.id("<PAD>"), Some(PAD_ID));
        assert_eq!(vocab.id("<BOS>"), Some(BOS_ID));
        assert_eq!(vocab.id("<EOS>"), Some(EOS_ID));
    }

    #[test]
    fn test_raw_ids_are_shifted() {
        let vocab = chars();
        assert_eq!(vocab.id("<space>"), Some(3));
        assert_eq!(vocab.id("a"), Some(4));
        assert_eq!(vocab.output_dim(), 4);
        assert_eq!(Vocabulary::shift_raw_ids(&[2, 7]).unwrap(), vec![3, 8]);
        assert!(Vocabulary::shift_raw_ids(&[1]).is_err());
        assert!(Vocabulary::shift_raw_ids(&[u32::MAX]).is_err());
    }

    #[test]
    fn test_decode_stops_at_eos_and_drops_noise() {
        let vocab = chars();
        let text = vocab.decode(&[BOS_ID, 4, 3, 6, 5, EOS_ID, 4, 4]);
        assert_eq!(text, "a b");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        assert!(Vocabulary::from_entries([("x", 3), ("y", 3)]).is_err());
        assert!(Vocabulary::from_entries([("x", 1)]).is_err());
        assert!(Vocabulary::from_entries([("x", 3), ("x", 4)]).is_err());
    }

    #[test]
    fn test_sparse_or_huge_ids_rejected() {
        let huge = Vocabulary::from_entries([("x", u32::MAX)]);
        assert!(matches!(huge, Err(AsrError::InvalidInput(_))));
        // 3 и 5 без 4
        let sparse = Vocabulary::from_entries([("x", 3), ("y", 5)]);
        assert!(matches!(sparse, Err(AsrError::InvalidInput(_))));
        assert_eq!(Vocabulary::from_entries([("y", 4), ("x", 3)]).unwrap().len(), 5);
    }

    #[test]
    fn test_json_file_with_huge_id_is_an_error() {
        let path = std::env::temp_dir().join(format!("las-vocab-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"a": 3, "b": 4294967295}"#).unwrap();
        let res = Vocabulary::from_json_file(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(res, Err(AsrError::InvalidInput(_))));
    }

    #[test]
    fn test_raw_reserved_entries_are_skipped() {
        let vocab = Vocabulary::from_raw_entries([("<unk>", 1), ("a", 2), ("b", 3)]).unwrap();
        assert_eq!(vocab.id("<unk>"), None);
        assert_eq!(vocab.id("a"), Some(3));
        assert_eq!(vocab.output_dim(), 2);

        let huge = Vocabulary::from_raw_entries([("a", 2), ("b", u32::MAX)]);
        assert!(matches!(huge, Err(AsrError::InvalidInput(_))));
    }
}
