use image::{GrayImage, Luma, Rgb, RgbImage};
use saliency_dataset::PairingConfig;
use std::fs;
use std::path::Path;

/// Write `count` 40x40 image/mask pairs in the DUTS-TR layout under `root`.
pub fn write_dataset(root: &Path, count: usize) -> anyhow::Result<PairingConfig> {
    let cfg = PairingConfig {
        root: root.to_path_buf(),
        ..Default::default()
    };
    fs::create_dir_all(cfg.image_dir())?;
    fs::create_dir_all(cfg.mask_dir())?;
    for i in 0..count {
        let img = RgbImage::from_fn(40, 40, |x, y| {
            Rgb([(x * 6) as u8, (y * 6) as u8, (i * 15) as u8])
        });
        img.save(cfg.image_dir().join(format!("sample_{i:02}.jpg")))?;
        let mask = GrayImage::from_fn(40, 40, |x, y| {
            Luma([if (10..30).contains(&x) && (10..30).contains(&y) { 255 } else { 0 }])
        });
        mask.save(cfg.mask_dir().join(format!("sample_{i:02}.png")))?;
    }
    Ok(cfg)
}
