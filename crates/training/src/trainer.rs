//! The iteration loop: batches in, optimizer steps and periodic checkpoints out.

use crate::checkpoint::checkpoint_path;
use crate::engine::SaliencyEngine;
use crate::error::{TrainError, TrainResult};
use crate::loss::fused_bce_loss;
use crate::scaler::{DynamicLossScaler, StepOutcome};
use crate::state::IterationState;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::FloatDType;
use saliency_dataset::BatchSource;
use std::path::PathBuf;
use std::time::Instant;

/// Loop budget and cadence.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub epochs: usize,
    pub max_iterations: Option<usize>,
    pub save_frq: usize,
    pub log_every: usize,
    pub model_dir: PathBuf,
    pub model_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct TrainSummary {
    pub iterations: usize,
    pub epochs_started: usize,
    pub skipped_steps: usize,
    pub checkpoints: Vec<PathBuf>,
    pub final_scale: f32,
}

/// Run the loop from `state` until the epoch or iteration budget is spent.
///
/// Any failure inside an iteration aborts the run.
pub fn train_loop<B, E>(
    engine: &mut E,
    source: &BatchSource,
    scaler: &mut DynamicLossScaler,
    settings: &LoopSettings,
    state: &mut IterationState,
    device: &B::Device,
) -> TrainResult<TrainSummary>
where
    B: AutodiffBackend,
    E: SaliencyEngine<B>,
{
    let mut summary = TrainSummary::default();
    let batch_size = source.batch_size();
    let dataset_len = source.len();

    for epoch in state.epoch..settings.epochs {
        state.epoch = epoch;
        summary.epochs_started += 1;
        engine.train();

        for (i, batch) in source.epoch(epoch)?.enumerate() {
            let batch = batch?;
            let (images, labels) = batch.into_tensors::<B>(device);

            engine.zero_grad();
            let started = Instant::now();
            // Loss and its gradients accumulate in f32 even for half-precision compute.
            let outputs = engine.forward(images).upcast();
            let labels = labels.cast(FloatDType::F32);
            let loss = fused_bce_loss(&outputs, &labels)?;
            let total = loss.total_value();
            if !total.is_finite() {
                return Err(TrainError::Numeric(format!(
                    "loss is {total} at iteration {}",
                    state.global_iter + 1
                )));
            }
            let target = loss.target();

            engine.backward(loss.total.mul_scalar(scaler.scale()));
            let overflow = engine.unscale_grads(scaler.inv_scale());
            if !overflow {
                engine.step();
            }
            if scaler.update(overflow) == StepOutcome::Skipped {
                summary.skipped_steps += 1;
            }
            state.record(total, target, started.elapsed());

            if state.global_iter % settings.log_every == 0 {
                tracing::info!(
                    "[epoch: {:3}/{:3}, batch: {:5}/{:5}, ite: {}] train loss: {:.6}, tar: {:.6}, step time: {:.6}",
                    epoch + 1,
                    settings.epochs,
                    (i + 1) * batch_size,
                    dataset_len,
                    state.global_iter,
                    state.mean_loss(),
                    state.mean_tar_loss(),
                    state.mean_step_time()
                );
            }

            if state.global_iter % settings.save_frq == 0 {
                let path = checkpoint_path(
                    &settings.model_dir,
                    &settings.model_name,
                    state.global_iter,
                    state.mean_loss(),
                    state.mean_tar_loss(),
                );
                engine.save(&path)?;
                tracing::info!("saved checkpoint {}", path.display());
                summary.checkpoints.push(path);
                state.reset_window();
                engine.train();
            }

            if settings.max_iterations.is_some_and(|max| state.global_iter >= max) {
                summary.iterations = state.global_iter;
                summary.final_scale = scaler.scale();
                return Ok(summary);
            }
        }
    }

    summary.iterations = state.global_iter;
    summary.final_scale = scaler.scale();
    Ok(summary)
}
