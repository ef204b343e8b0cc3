//! Error types for EfficientNet architecture derivation and weight loading.

use thiserror::Error;

/// Main error type for the EfficientNet toolkit.
///
/// Every variant is a configuration or programming error: nothing here is
/// retried, callers surface it as-is.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed size or stride descriptor, or an out-of-range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Block string that does not follow the block grammar
    #[error("Invalid block spec: {0}")]
    InvalidSpec(String),

    /// Model name outside the known EfficientNet family
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Parameters the model expects but the weight source lacks
    #[error("Missing keys when loading pretrained weights: {0:?}")]
    MissingWeightKey(Vec<String>),

    /// Parameters in the weight source that the model does not have
    #[error("Unexpected keys when loading pretrained weights: {0:?}")]
    UnexpectedWeightKey(Vec<String>),

    /// Parameters present on both sides whose shapes disagree
    #[error("Shape mismatch when loading pretrained weights: {0:?}")]
    WeightShapeMismatch(Vec<String>),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for EfficientNet operations.
pub type Result<T> = std::result::Result<T, Error>;
