//! Error types for shardforge

use thiserror::Error;

/// Result type alias using shardforge's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for conversion operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Invalid MoE config: {0}")]
    InvalidMoeConfig(String),

    #[error("Invalid parallel mapping: {0}")]
    InvalidMapping(String),

    #[error("{0}")]
    Other(String),
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}
