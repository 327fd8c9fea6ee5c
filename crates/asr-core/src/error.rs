//! Error types for RustLAS.

use thiserror::Error;

/// Main error type for recognizer operations.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Model construction / weight loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// Tensor shape or length-vector inconsistencies at a component boundary.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Invalid caller input (token ids out of range, empty batch, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for recognizer operations.
pub type AsrResult<T> = Result<T, AsrError>;
