//! Shuffled, optionally prefetched batch iteration over image/mask pairs.

use crate::aug::TransformPipeline;
use crate::types::{DatasetError, DatasetResult, Sample, SamplePair};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSourceConfig {
    pub batch_size: usize,
    /// Draw a fresh permutation every epoch.
    pub shuffle: bool,
    /// Background loader threads; 0 loads on the caller thread.
    pub workers: usize,
    /// Batches each worker may hold ahead of the consumer.
    pub prefetch_depth: usize,
    /// Seed for permutations and augmentation. Random when absent.
    pub seed: Option<u64>,
}

impl Default for BatchSourceConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            shuffle: true,
            workers: 1,
            prefetch_depth: 2,
            seed: None,
        }
    }
}

/// A batch assembled on the host, ready to be uploaded to a device.
#[derive(Debug, Clone)]
pub struct HostBatch {
    /// Images, `[len, 3, height, width]` row-major.
    pub images: Vec<f32>,
    /// Labels, `[len, 1, height, width]` row-major.
    pub labels: Vec<f32>,
    pub stems: Vec<String>,
    pub height: usize,
    pub width: usize,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    /// Upload images and labels as `[N, 3, H, W]` and `[N, 1, H, W]` float tensors.
    pub fn into_tensors<B: Backend>(self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let n = self.len();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(self.images, [n, 3, self.height, self.width]),
            device,
        );
        let labels = Tensor::<B, 4>::from_data(
            TensorData::new(self.labels, [n, 1, self.height, self.width]),
            device,
        );
        (images, labels)
    }
}

/// Loads the samples of one epoch. Shared between the caller and prefetch workers.
struct EpochLoader {
    pairs: Arc<Vec<SamplePair>>,
    pipeline: Arc<TransformPipeline>,
    seed: u64,
    epoch: usize,
}

impl EpochLoader {
    fn sample_seed(&self, position: usize) -> u64 {
        self.seed ^ ((self.epoch as u64) << 32 | position as u64)
    }

    fn load_sample(&self, position: usize, index: usize) -> DatasetResult<Sample> {
        let pair = &self.pairs[index];
        let image = image::open(&pair.image).map_err(|e| DatasetError::Image {
            path: pair.image.clone(),
            source: e,
        })?;
        let mask = image::open(&pair.mask).map_err(|e| DatasetError::Image {
            path: pair.mask.clone(),
            source: e,
        })?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.sample_seed(position));
        Ok(self.pipeline.apply(&pair.stem, image, mask, &mut rng))
    }

    /// `slots` holds `(epoch position, pair index)` for every sample of the batch.
    fn load_batch(&self, slots: &[(usize, usize)]) -> DatasetResult<HostBatch> {
        let t_load = Instant::now();
        let samples = slots
            .par_iter()
            .map(|(position, index)| self.load_sample(*position, *index))
            .collect::<DatasetResult<Vec<_>>>()?;

        let Some(first) = samples.first() else {
            return Err(DatasetError::Other("cannot assemble an empty batch".into()));
        };
        let (width, height) = (first.width, first.height);
        let plane = (width * height) as usize;
        let mut images = Vec::with_capacity(samples.len() * 3 * plane);
        let mut labels = Vec::with_capacity(samples.len() * plane);
        let mut stems = Vec::with_capacity(samples.len());
        for sample in samples {
            if (sample.width, sample.height) != (width, height) {
                return Err(DatasetError::Other(format!(
                    "batch contains varying sample sizes: {} is {}x{}, expected {}x{}",
                    sample.stem, sample.width, sample.height, width, height
                )));
            }
            images.extend_from_slice(&sample.image_chw);
            labels.extend_from_slice(&sample.label_chw);
            stems.push(sample.stem);
        }
        tracing::trace!(
            "loaded batch of {} in {:.2} ms",
            stems.len(),
            t_load.elapsed().as_secs_f64() * 1000.0
        );
        Ok(HostBatch {
            images,
            labels,
            stems,
            height: height as usize,
            width: width as usize,
        })
    }
}

/// Restartable source of shuffled batches; call [`BatchSource::epoch`] once per pass.
pub struct BatchSource {
    pairs: Arc<Vec<SamplePair>>,
    pipeline: Arc<TransformPipeline>,
    cfg: BatchSourceConfig,
    seed: u64,
}

impl BatchSource {
    pub fn new(
        pairs: Vec<SamplePair>,
        pipeline: TransformPipeline,
        cfg: BatchSourceConfig,
    ) -> DatasetResult<Self> {
        if pairs.is_empty() {
            return Err(DatasetError::Config("batch source needs at least one sample".into()));
        }
        if cfg.batch_size == 0 {
            return Err(DatasetError::Config("batch size must be positive".into()));
        }
        let seed = cfg.seed.unwrap_or_else(|| rand::rng().random());
        tracing::debug!(
            "batch source: samples={} batch_size={} shuffle={} workers={} seed={} transform: {}",
            pairs.len(),
            cfg.batch_size,
            cfg.shuffle,
            cfg.workers,
            seed,
            pipeline.describe()
        );
        Ok(Self {
            pairs: Arc::new(pairs),
            pipeline: Arc::new(pipeline),
            cfg,
            seed,
        })
    }

    /// Number of samples in one full pass.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.cfg.batch_size
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.pairs.len().div_ceil(self.cfg.batch_size)
    }

    /// Sample order for `epoch`; identity when shuffling is off.
    pub fn permutation(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.pairs.len()).collect();
        if self.cfg.shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed ^ epoch as u64);
            order.shuffle(&mut rng);
        }
        order
    }

    /// Start a pass over the dataset. Workers (if any) begin loading immediately.
    pub fn epoch(&self, epoch: usize) -> DatasetResult<EpochIter> {
        let order = self.permutation(epoch);
        let plan: Vec<Vec<(usize, usize)>> = order
            .into_iter()
            .enumerate()
            .collect::<Vec<_>>()
            .chunks(self.cfg.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let loader = Arc::new(EpochLoader {
            pairs: self.pairs.clone(),
            pipeline: self.pipeline.clone(),
            seed: self.seed,
            epoch,
        });
        let total = plan.len();

        if self.cfg.workers == 0 {
            return Ok(EpochIter {
                inner: EpochIterKind::Direct {
                    loader,
                    plan,
                    cursor: 0,
                },
            });
        }

        let workers = self.cfg.workers.min(total.max(1));
        let plan = Arc::new(plan);
        let mut receivers = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = bounded(self.cfg.prefetch_depth.max(1));
            let loader = loader.clone();
            let plan = plan.clone();
            thread::Builder::new()
                .name(format!("batch-prefetch-{worker}"))
                .spawn(move || {
                    for slots in plan.iter().skip(worker).step_by(workers) {
                        let res = loader.load_batch(slots);
                        let failed = res.is_err();
                        if tx.send(res).is_err() || failed {
                            break;
                        }
                    }
                })
                .map_err(|e| DatasetError::Io {
                    path: format!("batch-prefetch-{worker}").into(),
                    source: e,
                })?;
            receivers.push(rx);
        }
        Ok(EpochIter {
            inner: EpochIterKind::Prefetch {
                receivers,
                next: 0,
                total,
            },
        })
    }
}

/// Batches of a single epoch, in permutation order regardless of worker count.
pub struct EpochIter {
    inner: EpochIterKind,
}

enum EpochIterKind {
    Direct {
        loader: Arc<EpochLoader>,
        plan: Vec<Vec<(usize, usize)>>,
        cursor: usize,
    },
    Prefetch {
        receivers: Vec<Receiver<DatasetResult<HostBatch>>>,
        next: usize,
        total: usize,
    },
}

impl Iterator for EpochIter {
    type Item = DatasetResult<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EpochIterKind::Direct {
                loader,
                plan,
                cursor,
            } => {
                let slots = plan.get(*cursor)?;
                *cursor += 1;
                Some(loader.load_batch(slots))
            }
            EpochIterKind::Prefetch {
                receivers,
                next,
                total,
            } => {
                if *next >= *total {
                    return None;
                }
                let worker = *next % receivers.len();
                match receivers[worker].recv() {
                    Ok(res) => {
                        *next += 1;
                        Some(res)
                    }
                    Err(_) => {
                        *next = *total;
                        Some(Err(DatasetError::WorkerDisconnected { worker }))
                    }
                }
            }
        }
    }
}
