use saliency_dataset::DatasetError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    /// Bad settings or dataset layout; raised before the first iteration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Out-of-range prediction or non-finite loss.
    #[error("numeric error: {0}")]
    Numeric(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint error at {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    #[error("dataset error: {0}")]
    Dataset(#[source] DatasetError),
}

impl From<DatasetError> for TrainError {
    fn from(err: DatasetError) -> Self {
        match err {
            DatasetError::MissingDirectory { .. }
            | DatasetError::NoImages { .. }
            | DatasetError::MissingMask { .. }
            | DatasetError::CountMismatch { .. }
            | DatasetError::Config(_) => TrainError::Configuration(err.to_string()),
            other => TrainError::Dataset(other),
        }
    }
}
