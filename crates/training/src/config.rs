//! Run configuration: defaults, optional TOML file, validation.

use crate::error::{TrainError, TrainResult};
use crate::scaler::ScalerConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::AdamConfig;
use clap::ValueEnum;
use models::{ModelKind, QuantBackend, UpsampleMode};
use saliency_dataset::{BatchSourceConfig, PairingConfig, TransformConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    #[value(name = "ndarray")]
    NdArray,
    Wgpu,
}

/// Float element type of the forward and backward passes.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    /// Half precision; only the wgpu backend computes in f16.
    F16,
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn adam(&self) -> AdamConfig {
        let cfg = AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.epsilon);
        if self.weight_decay > 0.0 {
            cfg.with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay)))
        } else {
            cfg
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub model: ModelKind,
    /// Checkpoint directory; `saved_models/<model>` when unset.
    pub model_dir: Option<PathBuf>,
    pub epochs: usize,
    /// Stop after this many iterations even if epochs remain.
    pub max_iterations: Option<usize>,
    /// Reserved for a validation pass; not used by the training loop.
    pub val_batch_size: usize,
    pub save_frq: usize,
    pub log_every: usize,
    pub backend: BackendKind,
    pub precision: Precision,
    pub quant_backend: QuantBackend,
    pub upsample: UpsampleMode,
    /// Checkpoint to restore weights from before training.
    pub resume: Option<PathBuf>,
    pub data: PairingConfig,
    pub loader: BatchSourceConfig,
    pub transform: TransformConfig,
    pub optimizer: OptimizerConfig,
    pub scaler: ScalerConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::default(),
            model_dir: None,
            epochs: 100_000,
            max_iterations: None,
            val_batch_size: 1,
            save_frq: 2000,
            log_every: 10,
            backend: BackendKind::default(),
            precision: Precision::default(),
            quant_backend: QuantBackend::default(),
            upsample: UpsampleMode::default(),
            resume: None,
            data: PairingConfig::default(),
            loader: BatchSourceConfig::default(),
            transform: TransformConfig::default(),
            optimizer: OptimizerConfig::default(),
            scaler: ScalerConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_toml_str(text: &str) -> TrainResult<Self> {
        toml::from_str(text).map_err(|e| TrainError::Configuration(format!("invalid config: {e}")))
    }

    pub fn from_toml_file(path: &Path) -> TrainResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| TrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|e| match e {
            TrainError::Configuration(msg) => {
                TrainError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| Path::new("saved_models").join(self.model.name()))
    }

    pub fn validate(&self) -> TrainResult<()> {
        let positive = [
            ("epochs", self.epochs),
            ("save_frq", self.save_frq),
            ("log_every", self.log_every),
            ("loader.batch_size", self.loader.batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainError::Configuration(format!("{name} must be positive")));
            }
        }
        if self.max_iterations == Some(0) {
            return Err(TrainError::Configuration(
                "max_iterations must be positive when set".into(),
            ));
        }
        let opt = &self.optimizer;
        if !(opt.lr.is_finite() && opt.lr > 0.0) {
            return Err(TrainError::Configuration(format!(
                "learning rate must be positive, got {}",
                opt.lr
            )));
        }
        for (name, beta) in [("beta_1", opt.beta_1), ("beta_2", opt.beta_2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TrainError::Configuration(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if opt.epsilon <= 0.0 || opt.weight_decay < 0.0 {
            return Err(TrainError::Configuration(
                "epsilon must be positive and weight decay non-negative".into(),
            ));
        }
        self.scaler.validate()
    }
}
