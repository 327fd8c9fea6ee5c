//! LAS (Listen, Attend and Spell) — seq2seq распознавание речи на Candle.
//!
//! VGG2L + пирамидальный BLSTM слушают, многоголовое location-aware
//! внимание выравнивает, LSTMCell-декодер пишет токены (символы или BPE).
//! Teacher forcing задаётся извне через [`ForcingPolicy`].

pub mod attention;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod forcing;
pub mod lstm;
pub mod model;
pub mod sequence;
pub mod state_transform;
pub mod vgg;

pub use attention::{AttentionOutput, AttentionState, MultiHeadLocationAttention};
pub use config::{DecodeOptions, LasConfig};
pub use forcing::{ForcingPolicy, RandomForcing, ScriptedForcing};
pub use model::{LasModel, LasOutput};
pub use sequence::{PackedSequence, PaddedSequence};
