//! Core types and error definitions for saliency_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset directory missing: {path}")]
    MissingDirectory { path: PathBuf },
    #[error("no *.{ext} images found under {dir}")]
    NoImages { dir: PathBuf, ext: String },
    #[error("mask missing for image {image}: expected {mask}")]
    MissingMask { image: PathBuf, mask: PathBuf },
    #[error("{images} images but {masks} masks under {mask_dir}")]
    CountMismatch {
        images: usize,
        masks: usize,
        mask_dir: PathBuf,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid dataset configuration: {0}")]
    Config(String),
    #[error("prefetch worker {worker} stopped before the epoch finished")]
    WorkerDisconnected { worker: usize },
    #[error("{0}")]
    Other(String),
}

/// One image/mask pair discovered on disk, matched by file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePair {
    pub stem: String,
    pub image: PathBuf,
    pub mask: PathBuf,
}

/// A decoded and transformed sample.
#[derive(Debug, Clone)]
pub struct Sample {
    pub stem: String,
    /// Normalized image in CHW layout (3 channels).
    pub image_chw: Vec<f32>,
    /// Label in CHW layout (1 channel), scaled to [0, 1].
    pub label_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
}
