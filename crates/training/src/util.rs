use crate::checkpoint::{load_checkpoint, parse_iteration};
use crate::config::{BackendKind, Precision, TrainConfig};
use crate::engine::BurnEngine;
use crate::error::{TrainError, TrainResult};
use crate::scaler::DynamicLossScaler;
use crate::state::IterationState;
use crate::trainer::{train_loop, LoopSettings, TrainSummary};
use crate::CpuBackend;
use burn::backend::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use models::{ModelKind, QuantBackend, U2Net, U2NetConfig, UpsampleMode};
use saliency_dataset::{index_pairs, BatchSource, TransformPipeline};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Default)]
#[command(
    name = "train",
    about = "Train U2NET/U2NETP saliency models with quantization-aware training"
)]
pub struct TrainArgs {
    /// TOML config file; flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Model variant (u2net or u2netp).
    #[arg(long)]
    pub model: Option<ModelKind>,
    /// Dataset root containing DUTS-TR/.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Checkpoint directory (defaults to saved_models/<model>).
    #[arg(long)]
    pub model_dir: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Stop after this many iterations.
    #[arg(long)]
    pub max_iterations: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Save a checkpoint every N iterations.
    #[arg(long)]
    pub save_frq: Option<usize>,
    /// Print progress every N iterations.
    #[arg(long)]
    pub log_every: Option<usize>,
    /// Learning rate.
    #[arg(long)]
    pub lr: Option<f64>,
    /// Background batch loader threads (0 loads inline).
    #[arg(long)]
    pub workers: Option<usize>,
    /// Batches each loader thread may buffer.
    #[arg(long)]
    pub prefetch_depth: Option<usize>,
    /// Keep dataset order instead of reshuffling every epoch.
    #[arg(long)]
    pub no_shuffle: bool,
    /// Seed for shuffling and augmentation.
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub rescale: Option<u32>,
    #[arg(long)]
    pub crop: Option<u32>,
    /// Quantized kernel family the observers calibrate for (fbgemm or qnnpack).
    #[arg(long)]
    pub quant_backend: Option<QuantBackend>,
    /// Decoder resampling (nearest or bilinear).
    #[arg(long)]
    pub upsample: Option<UpsampleMode>,
    /// Compute backend.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
    /// Compute precision (f16 needs the wgpu backend).
    #[arg(long, value_enum)]
    pub precision: Option<Precision>,
    /// Disable dynamic loss scaling.
    #[arg(long)]
    pub no_loss_scaling: bool,
    /// Restore weights from a checkpoint and continue its iteration count.
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

impl TrainArgs {
    /// Defaults, then the config file, then flags.
    pub fn resolve(&self) -> TrainResult<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_toml_file(path)?,
            None => TrainConfig::default(),
        };
        if let Some(model) = self.model {
            cfg.model = model;
        }
        if let Some(dir) = &self.data_dir {
            cfg.data.root = dir.clone();
        }
        if let Some(dir) = &self.model_dir {
            cfg.model_dir = Some(dir.clone());
        }
        if let Some(epochs) = self.epochs {
            cfg.epochs = epochs;
        }
        if self.max_iterations.is_some() {
            cfg.max_iterations = self.max_iterations;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.loader.batch_size = batch_size;
        }
        if let Some(save_frq) = self.save_frq {
            cfg.save_frq = save_frq;
        }
        if let Some(log_every) = self.log_every {
            cfg.log_every = log_every;
        }
        if let Some(lr) = self.lr {
            cfg.optimizer.lr = lr;
        }
        if let Some(workers) = self.workers {
            cfg.loader.workers = workers;
        }
        if let Some(depth) = self.prefetch_depth {
            cfg.loader.prefetch_depth = depth;
        }
        if self.no_shuffle {
            cfg.loader.shuffle = false;
        }
        if self.seed.is_some() {
            cfg.loader.seed = self.seed;
        }
        if let Some(rescale) = self.rescale {
            cfg.transform.rescale = rescale;
        }
        if let Some(crop) = self.crop {
            cfg.transform.crop = crop;
        }
        if let Some(qb) = self.quant_backend {
            cfg.quant_backend = qb;
        }
        if let Some(upsample) = self.upsample {
            cfg.upsample = upsample;
        }
        if let Some(backend) = self.backend {
            cfg.backend = backend;
        }
        if let Some(precision) = self.precision {
            cfg.precision = precision;
        }
        if self.no_loss_scaling {
            cfg.scaler.enabled = false;
        }
        if self.resume.is_some() {
            cfg.resume = self.resume.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainSummary> {
    let cfg = args.resolve()?;
    let backend = effective_backend(cfg.backend);
    let summary = match (backend, effective_precision(backend, cfg.precision)) {
        #[cfg(feature = "backend-wgpu")]
        (BackendKind::Wgpu, Precision::F16) => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            train_with_config::<Autodiff<crate::WgpuHalfBackend>>(&cfg, &device)?
        }
        #[cfg(feature = "backend-wgpu")]
        (BackendKind::Wgpu, Precision::F32) => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            train_with_config::<Autodiff<crate::WgpuBackend>>(&cfg, &device)?
        }
        _ => train_with_config::<Autodiff<CpuBackend>>(&cfg, &Default::default())?,
    };
    tracing::info!(
        "finished after {} iterations ({} checkpoints, {} skipped steps, loss scale {})",
        summary.iterations,
        summary.checkpoints.len(),
        summary.skipped_steps,
        summary.final_scale
    );
    Ok(summary)
}

/// Accelerators that were not compiled in fall back to the CPU backend.
pub fn effective_backend(requested: BackendKind) -> BackendKind {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (requested, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            tracing::warn!(
                "backend-wgpu feature not enabled; falling back to the ndarray CPU backend"
            );
            BackendKind::NdArray
        }
        (kind, _) => kind,
    }
}

/// Half precision runs only on the GPU backend; the CPU backend computes in f32.
pub fn effective_precision(backend: BackendKind, requested: Precision) -> Precision {
    match (backend, requested) {
        (BackendKind::NdArray, Precision::F16) => {
            tracing::warn!("the ndarray backend has no f16 kernels; computing in f32");
            Precision::F32
        }
        (_, precision) => precision,
    }
}

/// Iteration count embedded in a checkpoint name.
fn resume_iteration(path: &Path) -> TrainResult<usize> {
    parse_iteration(path).ok_or_else(|| {
        TrainError::Configuration(format!(
            "cannot resume from {}: name does not carry an iteration count \
             (<model>_bce_itr_<iter>_train_<loss>_tar_<tar>.pth)",
            path.display()
        ))
    })
}

/// Build dataset, model and optimizer from `cfg` and run the loop on backend `B`.
pub fn train_with_config<B: AutodiffBackend>(
    cfg: &TrainConfig,
    device: &B::Device,
) -> TrainResult<TrainSummary> {
    let resume_from = cfg
        .resume
        .as_deref()
        .map(|path| resume_iteration(path).map(|iteration| (path, iteration)))
        .transpose()?;
    let pairs = index_pairs(&cfg.data)?;
    tracing::info!("---");
    tracing::info!("train images: {}", pairs.len());
    tracing::info!("train labels: {}", pairs.len());
    tracing::info!("---");

    let pipeline = TransformPipeline::new(cfg.transform)?;
    let source = BatchSource::new(pairs, pipeline, cfg.loader.clone())?;

    let model: U2Net<B> = U2NetConfig::for_kind(cfg.model)
        .with_quant_backend(cfg.quant_backend)
        .with_upsample(cfg.upsample)
        .init(device);
    let (model, mut state) = match resume_from {
        Some((path, iteration)) => {
            let model = load_checkpoint(model, path, device)?;
            tracing::info!(
                "resumed weights from {} at iteration {iteration}",
                path.display()
            );
            (model, IterationState::starting_at(iteration))
        }
        None => (model, IterationState::default()),
    };

    tracing::info!("---define optimizer...");
    let optim = cfg.optimizer.adam().init::<B, U2Net<B>>();
    let mut engine = BurnEngine::new(model, optim, cfg.optimizer.lr);
    let mut scaler = DynamicLossScaler::new(cfg.scaler);

    let settings = LoopSettings {
        epochs: cfg.epochs,
        max_iterations: cfg.max_iterations,
        save_frq: cfg.save_frq,
        log_every: cfg.log_every,
        model_dir: cfg.model_dir(),
        model_name: cfg.model.name().to_string(),
    };
    tracing::info!(
        "---start training... model={} quant={} precision={:?} samples={} batch_size={}",
        cfg.model,
        cfg.quant_backend,
        cfg.precision,
        source.len(),
        source.batch_size()
    );
    train_loop(&mut engine, &source, &mut scaler, &settings, &mut state, device)
}
