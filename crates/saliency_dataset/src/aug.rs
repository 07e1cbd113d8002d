//! Rescale / random-crop / normalize pipeline applied to every image/mask pair.

use crate::types::{DatasetError, DatasetResult, Sample};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-channel ImageNet statistics used by the normalization step.
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

const LABEL_MAX_EPS: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Square size both image and mask are resized to before cropping.
    pub rescale: u32,
    /// Square size of the random crop taken from the rescaled pair.
    pub crop: u32,
    /// Probability of flipping the pair upside down before cropping.
    pub flip_vertical_prob: f32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            rescale: 320,
            crop: 288,
            flip_vertical_prob: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformPipeline {
    cfg: TransformConfig,
}

impl TransformPipeline {
    pub fn new(cfg: TransformConfig) -> DatasetResult<Self> {
        if cfg.crop == 0 {
            return Err(DatasetError::Config("crop size must be positive".into()));
        }
        if cfg.crop > cfg.rescale {
            return Err(DatasetError::Config(format!(
                "crop size {} exceeds rescale size {}",
                cfg.crop, cfg.rescale
            )));
        }
        if !(0.0..=1.0).contains(&cfg.flip_vertical_prob) {
            return Err(DatasetError::Config(format!(
                "flip probability {} outside [0, 1]",
                cfg.flip_vertical_prob
            )));
        }
        Ok(Self { cfg })
    }

    pub fn describe(&self) -> String {
        format!(
            "rescale={}x{} crop={}x{} flip_v_p={:.2}",
            self.cfg.rescale,
            self.cfg.rescale,
            self.cfg.crop,
            self.cfg.crop,
            self.cfg.flip_vertical_prob
        )
    }

    pub fn apply<R: Rng>(
        &self,
        stem: &str,
        image: DynamicImage,
        mask: DynamicImage,
        rng: &mut R,
    ) -> Sample {
        let size = self.cfg.rescale;
        let rgb = image::imageops::resize(&image.to_rgb8(), size, size, FilterType::Triangle);
        let gray = image::imageops::resize(&mask.to_luma8(), size, size, FilterType::Nearest);

        let (rgb, gray) = if rng.random::<f32>() < self.cfg.flip_vertical_prob {
            (
                image::imageops::flip_vertical(&rgb),
                image::imageops::flip_vertical(&gray),
            )
        } else {
            (rgb, gray)
        };

        let crop = self.cfg.crop;
        let top = rng.random_range(0..=size - crop);
        let left = rng.random_range(0..=size - crop);
        let rgb = image::imageops::crop_imm(&rgb, left, top, crop, crop).to_image();
        let gray = image::imageops::crop_imm(&gray, left, top, crop, crop).to_image();

        Sample {
            stem: stem.to_string(),
            image_chw: normalize_image(&rgb),
            label_chw: normalize_label(&gray),
            width: crop,
            height: crop,
        }
    }
}

/// Scale by the brightest channel value, then standardize each channel.
pub fn normalize_image(img: &RgbImage) -> Vec<f32> {
    let max = img.as_raw().iter().copied().max().unwrap_or(0);
    let max = if max == 0 { 1.0 } else { max as f32 };
    let (w, h) = img.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0.0f32; plane * 3];
    for (i, px) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = (px[c] as f32 / max - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
        }
    }
    out
}

/// Scale the mask to [0, 1] by its maximum; near-empty masks are left as is.
pub fn normalize_label(mask: &GrayImage) -> Vec<f32> {
    let raw = mask.as_raw();
    let max = raw.iter().copied().max().unwrap_or(0) as f32;
    if max < LABEL_MAX_EPS {
        return raw.iter().map(|v| *v as f32).collect();
    }
    raw.iter().map(|v| *v as f32 / max).collect()
}
