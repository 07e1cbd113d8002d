//! Burn models for salient object segmentation.
//!
//! - `U2Net`: nested U-structure network built from residual U-blocks, in a
//!   full (U2NET) and a light (U2NETP) layout.
//! - `quant`: fake-quantized convolutions and observers used for
//!   quantization-aware training.
//!
//! Both layouts produce the same module type; `ModelKind` only picks the
//! stage widths at construction.

pub mod quant;
pub mod u2net;

use burn::tensor::backend::Backend;
use burn::tensor::{FloatDType, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use quant::{FakeQuant, QatConv2d, QatConv2dConfig, QuantBackend, QuantScheme};
pub use u2net::{RebnConv, Rsu, RsuConfig, U2Net, U2NetConfig, UpsampleMode, PRED_EPS};

/// Fused map plus one map per decoder depth.
pub const SIDE_OUTPUTS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModelKind {
    /// U2NET, ~44M parameters.
    #[serde(rename = "u2net")]
    Full,
    /// U2NETP, ~1.1M parameters.
    #[default]
    #[serde(rename = "u2netp")]
    Light,
}

impl ModelKind {
    /// Name used in checkpoint file names.
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Full => "u2net",
            ModelKind::Light => "u2netp",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "u2net" | "full" => Ok(ModelKind::Full),
            "u2netp" | "light" => Ok(ModelKind::Light),
            other => Err(format!("unknown model '{other}' (u2net|u2netp)")),
        }
    }
}

/// Saliency maps `[N, 1, H, W]` in (0, 1): index 0 is the fused output, 1..=6 the side outputs.
#[derive(Debug, Clone)]
pub struct SideOutputs<B: Backend> {
    pub maps: [Tensor<B, 4>; SIDE_OUTPUTS],
}

impl<B: Backend> SideOutputs<B> {
    pub fn new(maps: [Tensor<B, 4>; SIDE_OUTPUTS]) -> Self {
        Self { maps }
    }

    pub fn fused(&self) -> &Tensor<B, 4> {
        &self.maps[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor<B, 4>> {
        self.maps.iter()
    }

    /// Cast every map to f32, whatever precision the forward pass ran in.
    pub fn upcast(self) -> Self {
        self.map(|m| m.cast(FloatDType::F32))
    }

    /// Move every map onto another backend (e.g. drop autodiff tracking).
    pub fn map<B2: Backend>(self, f: impl FnMut(Tensor<B, 4>) -> Tensor<B2, 4>) -> SideOutputs<B2> {
        SideOutputs {
            maps: self.maps.map(f),
        }
    }
}

/// A network producing the seven saliency maps from an image batch `[N, 3, H, W]`.
pub trait SaliencyModel<B: Backend> {
    fn forward_sides(&self, images: Tensor<B, 4>) -> SideOutputs<B>;
}

pub mod prelude {
    pub use crate::{
        ModelKind, QuantBackend, SaliencyModel, SideOutputs, U2Net, U2NetConfig, UpsampleMode,
        SIDE_OUTPUTS,
    };
}
