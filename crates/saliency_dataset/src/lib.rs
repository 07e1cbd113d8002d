//! Dataset indexing, transforms, and prefetched batch iteration for saliency training.
//!
//! This crate provides:
//! - Pairing `<id>.jpg` images with `<id>.png` masks by file stem
//! - The rescale → random crop → normalize transform pipeline
//! - A shuffled, restartable batch source with background prefetch workers

pub mod aug;
pub mod batch;
pub mod pairing;
pub mod types;

pub use aug::{TransformConfig, TransformPipeline, CHANNEL_MEAN, CHANNEL_STD};
pub use batch::{BatchSource, BatchSourceConfig, EpochIter, HostBatch};
pub use pairing::{index_pairs, PairingConfig};
pub use types::*;
