//! # asr-core
//!
//! Базовые типы и определения ошибок для RustLAS.
//!
//! Крейт не знает ничего об архитектуре модели и предоставляет то, что
//! модели получает на вход от внешнего препроцессинга:
//!
//! - Унифицированная обработка ошибок через [`AsrError`]
//! - Пакетирование высказываний ([`Utterance`] → [`FeatureBatch`]) с сортировкой
//!   по убыванию длины
//! - Словарь выходных токенов [`Vocabulary`] с зарезервированными
//!   `<PAD>`/`<BOS>`/`<EOS>`

pub mod error;
pub mod types;
pub mod vocab;

pub use error::{AsrError, AsrResult};
pub use types::{collate, pad_list, FeatureBatch, Utterance};
pub use vocab::{Vocabulary, BOS_ID, EOS_ID, PAD_ID};
