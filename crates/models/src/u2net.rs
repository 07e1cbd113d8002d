//! U2NET / U2NETP saliency networks built from residual U-blocks (RSU).

use crate::quant::{FakeQuant, QatConv2d, QatConv2dConfig, QuantBackend, QuantScheme};
use crate::{ModelKind, SaliencyModel, SideOutputs};
use burn::module::Module;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Predictions are clamped to `[PRED_EPS, 1 - PRED_EPS]` so BCE never sees 0 or 1.
pub const PRED_EPS: f32 = 1e-6;

/// Resampling used when decoder features are brought back to skip resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsampleMode {
    /// Differentiable on every backend.
    #[default]
    Nearest,
    Bilinear,
}

impl FromStr for UpsampleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(UpsampleMode::Nearest),
            "bilinear" => Ok(UpsampleMode::Bilinear),
            other => Err(format!("unknown upsample mode '{other}' (nearest|bilinear)")),
        }
    }
}

impl fmt::Display for UpsampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsampleMode::Nearest => f.write_str("nearest"),
            UpsampleMode::Bilinear => f.write_str("bilinear"),
        }
    }
}

fn resize_to<B: Backend>(x: Tensor<B, 4>, size: [usize; 2], bilinear: bool) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if [h, w] == size {
        return x;
    }
    let mode = if bilinear {
        InterpolateMode::Bilinear
    } else {
        InterpolateMode::Nearest
    };
    interpolate(x, size, InterpolateOptions::new(mode))
}

fn spatial<B: Backend>(x: &Tensor<B, 4>) -> [usize; 2] {
    let [_, _, h, w] = x.dims();
    [h, w]
}

fn half_pool() -> MaxPool2d {
    MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()
}

/// Quantized conv → batch norm → ReLU.
#[derive(Module, Debug)]
pub struct RebnConv<B: Backend> {
    conv: QatConv2d<B>,
    norm: BatchNorm<B>,
}

impl<B: Backend> RebnConv<B> {
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        dilation: usize,
        backend: QuantBackend,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: QatConv2dConfig::new(in_ch, out_ch, 3)
                .with_dilation(dilation)
                .with_backend(backend)
                .init(device),
            norm: BatchNormConfig::new(out_ch).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Shape of one residual U-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsuConfig {
    /// Number of encoder levels including the bottom (4..=7).
    pub height: usize,
    pub in_ch: usize,
    pub mid_ch: usize,
    pub out_ch: usize,
    /// Replace pooling with growing dilation (the "F" blocks).
    pub dilated: bool,
}

impl RsuConfig {
    pub const fn new(height: usize, in_ch: usize, mid_ch: usize, out_ch: usize) -> Self {
        Self {
            height,
            in_ch,
            mid_ch,
            out_ch,
            dilated: false,
        }
    }

    pub const fn dilated(in_ch: usize, mid_ch: usize, out_ch: usize) -> Self {
        Self {
            height: 4,
            in_ch,
            mid_ch,
            out_ch,
            dilated: true,
        }
    }

    pub fn init<B: Backend>(&self, backend: QuantBackend, device: &B::Device) -> Rsu<B> {
        let levels = self.height.max(2) - 1;
        let enc_dilation = |i: usize| if self.dilated { 1usize << i } else { 1 };
        let bottom_dilation = if self.dilated { 1usize << levels } else { 2 };

        let conv_in = RebnConv::new(self.in_ch, self.out_ch, 1, backend, device);
        let encoders = (0..levels)
            .map(|i| {
                let in_ch = if i == 0 { self.out_ch } else { self.mid_ch };
                RebnConv::new(in_ch, self.mid_ch, enc_dilation(i), backend, device)
            })
            .collect();
        let bottom = RebnConv::new(self.mid_ch, self.mid_ch, bottom_dilation, backend, device);
        let decoders = (0..levels)
            .map(|j| {
                let out_ch = if j + 1 == levels { self.out_ch } else { self.mid_ch };
                let dilation = enc_dilation(levels - 1 - j);
                RebnConv::new(self.mid_ch * 2, out_ch, dilation, backend, device)
            })
            .collect();
        Rsu {
            conv_in,
            encoders,
            bottom,
            decoders,
            pool: half_pool(),
            pooled: !self.dilated,
        }
    }
}

/// Residual U-block: a small encoder/decoder whose output is added to its input projection.
#[derive(Module, Debug)]
pub struct Rsu<B: Backend> {
    conv_in: RebnConv<B>,
    encoders: Vec<RebnConv<B>>,
    bottom: RebnConv<B>,
    decoders: Vec<RebnConv<B>>,
    pool: MaxPool2d,
    pooled: bool,
}

impl<B: Backend> Rsu<B> {
    pub fn forward(&self, x: Tensor<B, 4>, bilinear: bool) -> Tensor<B, 4> {
        let hx_in = self.conv_in.forward(x);

        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut hx = hx_in.clone();
        for (i, enc) in self.encoders.iter().enumerate() {
            if i > 0 && self.pooled {
                hx = self.pool.forward(hx);
            }
            hx = enc.forward(hx);
            skips.push(hx.clone());
        }
        let mut d = self.bottom.forward(hx);

        for (dec, skip) in self.decoders.iter().zip(skips.into_iter().rev()) {
            let d_up = resize_to(d, spatial(&skip), bilinear);
            d = dec.forward(Tensor::cat(vec![d_up, skip], 1));
        }
        d + hx_in
    }
}

/// Stage layout of a U2NET-family network.
#[derive(Debug, Clone, PartialEq)]
pub struct U2NetConfig {
    pub kind: ModelKind,
    pub in_channels: usize,
    pub out_channels: usize,
    /// Six encoder stages, each followed by 2x pooling except the last.
    pub encoders: [RsuConfig; 6],
    /// Five decoder stages, deepest first.
    pub decoders: [RsuConfig; 5],
    /// Channels feeding the six side heads, shallowest first.
    pub side_channels: [usize; 6],
    pub quant_backend: QuantBackend,
    pub upsample: UpsampleMode,
}

impl U2NetConfig {
    /// Full-size U2NET (about 44M parameters).
    pub fn full() -> Self {
        Self {
            kind: ModelKind::Full,
            in_channels: 3,
            out_channels: 1,
            encoders: [
                RsuConfig::new(7, 3, 32, 64),
                RsuConfig::new(6, 64, 32, 128),
                RsuConfig::new(5, 128, 64, 256),
                RsuConfig::new(4, 256, 128, 512),
                RsuConfig::dilated(512, 256, 512),
                RsuConfig::dilated(512, 256, 512),
            ],
            decoders: [
                RsuConfig::dilated(1024, 256, 512),
                RsuConfig::new(4, 1024, 128, 256),
                RsuConfig::new(5, 512, 64, 128),
                RsuConfig::new(6, 256, 32, 64),
                RsuConfig::new(7, 128, 16, 64),
            ],
            side_channels: [64, 64, 128, 256, 512, 512],
            quant_backend: QuantBackend::default(),
            upsample: UpsampleMode::default(),
        }
    }

    /// Lightweight U2NETP (about 1.1M parameters).
    pub fn light() -> Self {
        Self {
            kind: ModelKind::Light,
            in_channels: 3,
            out_channels: 1,
            encoders: [
                RsuConfig::new(7, 3, 16, 64),
                RsuConfig::new(6, 64, 16, 64),
                RsuConfig::new(5, 64, 16, 64),
                RsuConfig::new(4, 64, 16, 64),
                RsuConfig::dilated(64, 16, 64),
                RsuConfig::dilated(64, 16, 64),
            ],
            decoders: [
                RsuConfig::dilated(128, 16, 64),
                RsuConfig::new(4, 128, 16, 64),
                RsuConfig::new(5, 128, 16, 64),
                RsuConfig::new(6, 128, 16, 64),
                RsuConfig::new(7, 128, 16, 64),
            ],
            side_channels: [64; 6],
            quant_backend: QuantBackend::default(),
            upsample: UpsampleMode::default(),
        }
    }

    pub fn for_kind(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Full => Self::full(),
            ModelKind::Light => Self::light(),
        }
    }

    pub fn with_quant_backend(mut self, backend: QuantBackend) -> Self {
        self.quant_backend = backend;
        self
    }

    pub fn with_upsample(mut self, upsample: UpsampleMode) -> Self {
        self.upsample = upsample;
        self
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> U2Net<B> {
        let backend = self.quant_backend;
        let sides = self
            .side_channels
            .iter()
            .map(|ch| {
                QatConv2dConfig::new(*ch, self.out_channels, 3)
                    .with_backend(backend)
                    .init(device)
            })
            .collect();
        U2Net {
            input_quant: FakeQuant::new(QuantScheme::activations(backend), device),
            encoders: self.encoders.iter().map(|c| c.init(backend, device)).collect(),
            decoders: self.decoders.iter().map(|c| c.init(backend, device)).collect(),
            sides,
            fuse: QatConv2dConfig::new(6 * self.out_channels, self.out_channels, 1)
                .with_backend(backend)
                .init(device),
            pool: half_pool(),
            bilinear: self.upsample == UpsampleMode::Bilinear,
        }
    }
}

#[derive(Module, Debug)]
pub struct U2Net<B: Backend> {
    input_quant: FakeQuant<B>,
    encoders: Vec<Rsu<B>>,
    decoders: Vec<Rsu<B>>,
    sides: Vec<QatConv2d<B>>,
    fuse: QatConv2d<B>,
    pool: MaxPool2d,
    bilinear: bool,
}

impl<B: Backend> U2Net<B> {
    /// Returns the fused map followed by the six side maps, all at input resolution.
    pub fn forward(&self, images: Tensor<B, 4>) -> SideOutputs<B> {
        let out_size = spatial(&images);
        let mut hx = self.input_quant.forward(images);

        let mut features = Vec::with_capacity(self.encoders.len());
        for (i, stage) in self.encoders.iter().enumerate() {
            if i > 0 {
                hx = self.pool.forward(hx);
            }
            hx = stage.forward(hx, self.bilinear);
            features.push(hx.clone());
        }

        // Decoder stages consume the deepest feature first.
        let mut d = hx;
        let mut side_inputs = Vec::with_capacity(self.sides.len());
        side_inputs.push(d.clone());
        for (stage, skip) in self.decoders.iter().zip(features.iter().rev().skip(1)) {
            let d_up = resize_to(d, spatial(skip), self.bilinear);
            d = stage.forward(Tensor::cat(vec![d_up, skip.clone()], 1), self.bilinear);
            side_inputs.push(d.clone());
        }
        side_inputs.reverse();

        let sides: [Tensor<B, 4>; 6] = std::array::from_fn(|i| {
            let logits = self.sides[i].forward(side_inputs[i].clone());
            resize_to(logits, out_size, self.bilinear)
        });
        let fused = self.fuse.forward(Tensor::cat(sides.to_vec(), 1));

        let [d1, d2, d3, d4, d5, d6] = sides;
        SideOutputs::new([fused, d1, d2, d3, d4, d5, d6].map(saturate))
    }
}

fn saturate<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 4> {
    sigmoid(logits).clamp(PRED_EPS, 1.0 - PRED_EPS)
}

impl<B: Backend> SaliencyModel<B> for U2Net<B> {
    fn forward_sides(&self, images: Tensor<B, 4>) -> SideOutputs<B> {
        self.forward(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn rsu_keeps_spatial_size_and_projects_channels() {
        let device = Default::default();
        for cfg in [RsuConfig::new(4, 3, 4, 6), RsuConfig::dilated(3, 4, 6)] {
            let block = cfg.init::<TestBackend>(QuantBackend::Fbgemm, &device);
            let x = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
            assert_eq!(block.forward(x, false).dims(), [1, 6, 8, 8]);
        }
    }

    #[test]
    fn odd_sizes_are_restored_by_resampling() {
        let device = Default::default();
        let block = RsuConfig::new(5, 2, 3, 2).init::<TestBackend>(QuantBackend::Qnnpack, &device);
        let x = Tensor::<TestBackend, 4>::ones([2, 2, 11, 13], &device);
        assert_eq!(block.forward(x, false).dims(), [2, 2, 11, 13]);
    }

    #[test]
    fn variants_differ_only_in_widths() {
        let full = U2NetConfig::full();
        let light = U2NetConfig::light();
        assert_eq!(full.encoders.len(), light.encoders.len());
        assert_eq!(full.decoders[0].in_ch, 1024);
        assert_eq!(light.decoders[0].in_ch, 128);
        assert_eq!(U2NetConfig::for_kind(ModelKind::Light), light);
    }
}
