//! Training loop for U2NET/U2NETP saliency models.
//!
//! The loop pulls shuffled batches from [`saliency_dataset::BatchSource`],
//! drives a [`SaliencyEngine`] through forward, fused BCE loss, scaled
//! backward and optimizer step, and writes a checkpoint every `save_frq`
//! iterations.

#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod loss;
pub mod scaler;
pub mod state;
pub mod trainer;
pub mod util;

pub use checkpoint::{checkpoint_path, load_checkpoint, parse_iteration, save_checkpoint};
pub use config::{BackendKind, OptimizerConfig, Precision, TrainConfig};
pub use engine::{BurnEngine, SaliencyEngine};
pub use error::{TrainError, TrainResult};
pub use loss::{bce_mean, fused_bce_loss, FusedLoss};
pub use scaler::{DynamicLossScaler, ScalerConfig, StepOutcome};
pub use state::IterationState;
pub use trainer::{train_loop, LoopSettings, TrainSummary};
pub use util::{run_train, train_with_config, TrainArgs};

/// CPU backend, always available.
pub type CpuBackend = burn::backend::NdArray<f32>;
/// GPU backend when built with `backend-wgpu`.
#[cfg(feature = "backend-wgpu")]
pub type WgpuBackend = burn::backend::Wgpu<f32>;
/// Half-precision GPU backend.
#[cfg(feature = "backend-wgpu")]
pub type WgpuHalfBackend = burn::backend::Wgpu<burn::tensor::f16>;
