//! Fake quantization for quantization-aware training.
//!
//! Values are rounded onto an integer grid and mapped back to floats in the
//! forward pass; gradients pass straight through. Observers track the running
//! min/max of every quantized tensor while autodiff is enabled and freeze
//! otherwise, so a checkpoint carries the calibrated ranges.

use burn::module::{Module, Param, RunningState};
use burn::nn::Initializer;
use burn::tensor::backend::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MIN_SCALE: f32 = f32::EPSILON;

/// Target integer kernel family; decides the activation range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantBackend {
    /// x86 kernels; activations use a reduced 7-bit range.
    #[default]
    Fbgemm,
    /// ARM kernels; full 8-bit activation range.
    Qnnpack,
}

impl QuantBackend {
    /// Unsigned activation grid `(qmin, qmax)`.
    pub fn activation_range(&self) -> (f32, f32) {
        match self {
            QuantBackend::Fbgemm => (0.0, 127.0),
            QuantBackend::Qnnpack => (0.0, 255.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuantBackend::Fbgemm => "fbgemm",
            QuantBackend::Qnnpack => "qnnpack",
        }
    }
}

impl fmt::Display for QuantBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fbgemm" => Ok(QuantBackend::Fbgemm),
            "qnnpack" => Ok(QuantBackend::Qnnpack),
            other => Err(format!("unknown quantization backend '{other}' (fbgemm|qnnpack)")),
        }
    }
}

/// How a tensor is mapped onto its integer grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuantScheme {
    /// Zero-point 0, grid `[-128, 127]`. Used for weights.
    SymmetricInt8,
    /// Zero-point chosen from the observed range. Used for activations.
    Affine { qmin: f32, qmax: f32 },
}

impl QuantScheme {
    pub fn activations(backend: QuantBackend) -> Self {
        let (qmin, qmax) = backend.activation_range();
        QuantScheme::Affine { qmin, qmax }
    }
}

#[derive(Module, Debug)]
pub struct FakeQuant<B: Backend> {
    observed_min: RunningState<Tensor<B, 1>>,
    observed_max: RunningState<Tensor<B, 1>>,
    qmin: f32,
    qmax: f32,
    symmetric: bool,
}

impl<B: Backend> FakeQuant<B> {
    pub fn new(scheme: QuantScheme, device: &B::Device) -> Self {
        let (qmin, qmax, symmetric) = match scheme {
            QuantScheme::SymmetricInt8 => (-128.0, 127.0, true),
            QuantScheme::Affine { qmin, qmax } => (qmin, qmax, false),
        };
        Self {
            observed_min: RunningState::new(Tensor::zeros([1], device)),
            observed_max: RunningState::new(Tensor::zeros([1], device)),
            qmin,
            qmax,
            symmetric,
        }
    }

    /// Observed `(min, max)`, always bracketing zero.
    pub fn range(&self) -> (Tensor<B, 1>, Tensor<B, 1>) {
        (self.observed_min.value_sync(), self.observed_max.value_sync())
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let device = x.device();
        let (lo, hi) = if B::ad_enabled() {
            let lo = self
                .observed_min
                .value_sync()
                .to_device(&device)
                .min_pair(x.clone().detach().min());
            let hi = self
                .observed_max
                .value_sync()
                .to_device(&device)
                .max_pair(x.clone().detach().max());
            self.observed_min.update(lo.clone().detach());
            self.observed_max.update(hi.clone().detach());
            (lo, hi)
        } else {
            (
                self.observed_min.value_sync().to_device(&device),
                self.observed_max.value_sync().to_device(&device),
            )
        };

        let (scale, zero_point) = if self.symmetric {
            let amax = lo.neg().max_pair(hi);
            let scale = amax.div_scalar((self.qmax - self.qmin) / 2.0).clamp_min(MIN_SCALE);
            let zero_point = scale.zeros_like();
            (scale, zero_point)
        } else {
            let scale = (hi - lo.clone())
                .div_scalar(self.qmax - self.qmin)
                .clamp_min(MIN_SCALE);
            let zero_point = (lo.div(scale.clone()).round().neg() + self.qmin)
                .clamp(self.qmin, self.qmax);
            (scale, zero_point)
        };

        let scale = scale.reshape([1; D]);
        let zero_point = zero_point.reshape([1; D]);
        let detached = x.clone().detach();
        let q = (detached.clone().div(scale.clone()).round() + zero_point.clone())
            .clamp(self.qmin, self.qmax);
        let dq = (q - zero_point) * scale;
        // Straight-through estimator.
        x + (dq - detached)
    }
}

/// 2D convolution whose weights and outputs are fake-quantized.
#[derive(Module, Debug)]
pub struct QatConv2d<B: Backend> {
    weight: Param<Tensor<B, 4>>,
    bias: Param<Tensor<B, 1>>,
    weight_quant: FakeQuant<B>,
    output_quant: FakeQuant<B>,
    dilation: usize,
    padding: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct QatConv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub dilation: usize,
    pub backend: QuantBackend,
}

impl QatConv2dConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            dilation: 1,
            backend: QuantBackend::default(),
        }
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation.max(1);
        self
    }

    pub fn with_backend(mut self, backend: QuantBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Kaiming-normal weights (fan-out, ReLU gain) and zero bias.
    pub fn init<B: Backend>(&self, device: &B::Device) -> QatConv2d<B> {
        let k = self.kernel_size;
        let fan_in = self.in_channels * k * k;
        let fan_out = self.out_channels * k * k;
        let weight = Initializer::KaimingNormal {
            gain: 2.0f64.sqrt(),
            fan_out_only: true,
        }
        .init_with(
            [self.out_channels, self.in_channels, k, k],
            Some(fan_in),
            Some(fan_out),
            device,
        );
        let bias = Initializer::Zeros.init([self.out_channels], device);
        QatConv2d {
            weight,
            bias,
            weight_quant: FakeQuant::new(QuantScheme::SymmetricInt8, device),
            output_quant: FakeQuant::new(QuantScheme::activations(self.backend), device),
            dilation: self.dilation,
            // Keeps spatial size for odd kernels.
            padding: self.dilation * (k - 1) / 2,
        }
    }
}

impl<B: Backend> QatConv2d<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let weight = self.weight_quant.forward(self.weight.val());
        let out = conv2d(
            input,
            weight,
            Some(self.bias.val()),
            ConvOptions::new(
                [1, 1],
                [self.padding, self.padding],
                [self.dilation, self.dilation],
                1,
            ),
        );
        self.output_quant.forward(out)
    }
}
