//! End-to-end batch iteration over a synthetic DUTS-style layout.

use burn::backend::NdArray;
use image::{GrayImage, Luma, Rgb, RgbImage};
use saliency_dataset::{
    index_pairs, BatchSource, BatchSourceConfig, HostBatch, PairingConfig, TransformConfig,
    TransformPipeline,
};
use std::fs;
use std::path::Path;

fn write_dataset(root: &Path, count: usize) -> anyhow::Result<PairingConfig> {
    let cfg = PairingConfig {
        root: root.to_path_buf(),
        ..Default::default()
    };
    fs::create_dir_all(cfg.image_dir())?;
    fs::create_dir_all(cfg.mask_dir())?;
    for i in 0..count {
        let img = RgbImage::from_fn(24, 20, |x, y| {
            Rgb([(x * 10) as u8, (y * 12) as u8, (i * 20) as u8])
        });
        img.save(cfg.image_dir().join(format!("img_{i:02}.jpg")))?;
        let mask = GrayImage::from_fn(24, 20, |x, _| Luma([if x > 12 { 255 } else { 0 }]));
        mask.save(cfg.mask_dir().join(format!("img_{i:02}.png")))?;
    }
    Ok(cfg)
}

fn build_source(cfg: &PairingConfig, workers: usize) -> anyhow::Result<BatchSource> {
    let pairs = index_pairs(cfg)?;
    let pipeline = TransformPipeline::new(TransformConfig {
        rescale: 16,
        crop: 12,
        flip_vertical_prob: 0.5,
    })?;
    Ok(BatchSource::new(
        pairs,
        pipeline,
        BatchSourceConfig {
            batch_size: 4,
            shuffle: true,
            workers,
            prefetch_depth: 2,
            seed: Some(1234),
        },
    )?)
}

fn collect_epoch(src: &BatchSource, epoch: usize) -> anyhow::Result<Vec<HostBatch>> {
    let mut out = Vec::new();
    for batch in src.epoch(epoch)? {
        out.push(batch?);
    }
    Ok(out)
}

#[test]
fn worker_count_does_not_change_batches() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = write_dataset(tmp.path(), 10)?;

    let sync = build_source(&cfg, 0)?;
    let parallel = build_source(&cfg, 4)?;
    for epoch in 0..2 {
        let a = collect_epoch(&sync, epoch)?;
        let b = collect_epoch(&parallel, epoch)?;
        assert_eq!(a.len(), 3);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.stems, y.stems);
            assert_eq!(x.images, y.images);
            assert_eq!(x.labels, y.labels);
        }
    }
    Ok(())
}

#[test]
fn epoch_covers_every_sample_once() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = write_dataset(tmp.path(), 10)?;
    let src = build_source(&cfg, 2)?;

    let batches = collect_epoch(&src, 0)?;
    let sizes: Vec<_> = batches.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
    let mut stems: Vec<_> = batches.into_iter().flat_map(|b| b.stems).collect();
    stems.sort();
    stems.dedup();
    assert_eq!(stems.len(), 10);
    Ok(())
}

#[test]
fn host_batch_uploads_with_nchw_shapes() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = write_dataset(tmp.path(), 5)?;
    let src = build_source(&cfg, 0)?;
    let batch = src.epoch(0)?.next().expect("first batch")?;
    let device = Default::default();

    let (images, labels) = batch.into_tensors::<NdArray<f32>>(&device);
    assert_eq!(images.dims(), [4, 3, 12, 12]);
    assert_eq!(labels.dims(), [4, 1, 12, 12]);
    let max = labels.max().into_scalar();
    assert!(max <= 1.0);
    Ok(())
}
