//! Error type shared by all annotation phases.

use thiserror::Error;

/// Errors raised by the annotation core.
///
/// `DataFormat` covers malformed input tables, `Validation` covers
/// configuration or rule problems detected before any heavy computation.
#[derive(Debug, Error)]
pub enum IpaError {
    #[error("data format error: {0}")]
    DataFormat(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid sum formula `{formula}`: {reason}")]
    Formula { formula: String, reason: String },
    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, IpaError>;

impl IpaError {
    pub fn validation(msg: impl Into<String>) -> Self {
        IpaError::Validation(msg.into())
    }

    pub fn data_format(msg: impl Into<String>) -> Self {
        IpaError::DataFormat(msg.into())
    }
}
