//! Error types for checkpoint conversion.

use thiserror::Error;

/// Errors raised while loading, validating or converting a checkpoint.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model load error: {0}")]
    ModelLoadError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Low-rank adapter weights are present; they must be merged into the
    /// base weights before conversion.
    #[error("Unsupported weight format: {0}")]
    LoraNotMerged(String),

    /// Adapter (learned-bias / gating) weights are present.
    #[error("Unsupported conversion: {0}")]
    AdapterNotSupported(String),

    /// The head/group arithmetic or MLP layout cannot be expressed by the
    /// selected target family.
    #[error("Unsupported family configuration: {0}")]
    UnsupportedFamily(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Unexpected parameter: {0}")]
    UnexpectedParameter(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, Error>;
