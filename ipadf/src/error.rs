use std::path::PathBuf;

use ipacore::error::IpaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DfError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Core(#[from] IpaError),
    #[error("{table}: {message}")]
    DataFormat { table: String, message: String },
}

pub type Result<T> = std::result::Result<T, DfError>;

impl DfError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DfError::Io { path: path.into(), source }
    }

    pub fn data_format(table: impl Into<String>, message: impl Into<String>) -> Self {
        DfError::DataFormat { table: table.into(), message: message.into() }
    }
}
