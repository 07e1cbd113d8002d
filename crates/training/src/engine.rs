//! Training capability the loop drives: forward, gradient bookkeeping, update, persistence.

use crate::checkpoint::save_checkpoint;
use crate::error::TrainResult;
use burn::module::{AutodiffModule, ModuleVisitor, Param};
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use models::{SaliencyModel, SideOutputs};
use std::path::Path;

/// Everything the training loop needs from a differentiable model.
///
/// Gradients accumulate across [`backward`](SaliencyEngine::backward) calls
/// until [`zero_grad`](SaliencyEngine::zero_grad) clears them.
pub trait SaliencyEngine<B: AutodiffBackend> {
    /// Enter training mode: batch norm uses batch statistics and observers update.
    fn train(&mut self);
    fn is_training(&self) -> bool;
    fn zero_grad(&mut self);
    fn forward(&self, images: Tensor<B, 4>) -> SideOutputs<B>;
    fn backward(&mut self, loss: Tensor<B, 1>);
    /// Multiply accumulated gradients by `inv_scale`; returns true if any is non-finite.
    fn unscale_grads(&mut self, inv_scale: f32) -> bool;
    /// Apply the accumulated gradients with the configured learning rate.
    fn step(&mut self);
    fn save(&self, path: &Path) -> TrainResult<()>;
}

/// [`SaliencyEngine`] over a burn module and optimizer.
pub struct BurnEngine<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    model: M,
    optim: O,
    accumulator: GradientsAccumulator<M>,
    unscaled: Option<GradientsParams>,
    lr: f64,
    training: bool,
    _backend: std::marker::PhantomData<B>,
}

impl<B, M, O> BurnEngine<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SaliencyModel<B>,
    M::InnerModule: SaliencyModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(model: M, optim: O, lr: f64) -> Self {
        Self {
            model,
            optim,
            accumulator: GradientsAccumulator::new(),
            unscaled: None,
            lr,
            training: true,
            _backend: std::marker::PhantomData,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Leave training mode; forward passes then run without autodiff tracking.
    pub fn eval(&mut self) {
        self.training = false;
    }
}

impl<B, M, O> SaliencyEngine<B> for BurnEngine<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SaliencyModel<B>,
    M::InnerModule: SaliencyModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    fn train(&mut self) {
        self.training = true;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn zero_grad(&mut self) {
        let _ = self.accumulator.grads();
        self.unscaled = None;
    }

    fn forward(&self, images: Tensor<B, 4>) -> SideOutputs<B> {
        if self.training {
            return self.model.forward_sides(images);
        }
        self.model
            .valid()
            .forward_sides(images.inner())
            .map(Tensor::<B, 4>::from_inner)
    }

    fn backward(&mut self, loss: Tensor<B, 1>) {
        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.accumulator.accumulate(&self.model, grads);
    }

    fn unscale_grads(&mut self, inv_scale: f32) -> bool {
        let mut grads = match self.unscaled.take() {
            Some(grads) => grads,
            None => self.accumulator.grads(),
        };
        let mut visitor = Unscale {
            grads: &mut grads,
            inv_scale,
            overflow: false,
        };
        self.model.visit(&mut visitor);
        let overflow = visitor.overflow;
        self.unscaled = Some(grads);
        overflow
    }

    fn step(&mut self) {
        let grads = match self.unscaled.take() {
            Some(grads) => grads,
            None => self.accumulator.grads(),
        };
        self.model = self.optim.step(self.lr, self.model.clone(), grads);
    }

    fn save(&self, path: &Path) -> TrainResult<()> {
        save_checkpoint::<B, M>(&self.model, path)
    }
}

struct Unscale<'a> {
    grads: &'a mut GradientsParams,
    inv_scale: f32,
    overflow: bool,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inv_scale);
        let bad = grad
            .clone()
            .is_finite()
            .bool_not()
            .float()
            .sum()
            .into_scalar()
            .elem::<f32>();
        if bad > 0.0 {
            self.overflow = true;
        }
        self.grads.register::<B::InnerBackend, D>(param.id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Module;
    use burn::nn::{Linear, LinearConfig};
    use burn::optim::SgdConfig;
    use burn::tensor::backend::Backend;
    use burn::tensor::TensorData;

    type TestAutodiff = Autodiff<NdArray<f32>>;

    /// Per-pixel affine map followed by a sigmoid.
    #[derive(Module, Debug)]
    struct PixelSigmoid<B: Backend> {
        linear: Linear<B>,
    }

    impl<B: Backend> SaliencyModel<B> for PixelSigmoid<B> {
        fn forward_sides(&self, images: Tensor<B, 4>) -> SideOutputs<B> {
            let [n, _, h, w] = images.dims();
            let pixels = images.clone().mean_dim(1).reshape([n * h * w, 1]);
            let out = burn::tensor::activation::sigmoid(self.linear.forward(pixels))
                .reshape([n, 1, h, w]);
            SideOutputs::new(std::array::from_fn(|_| out.clone()))
        }
    }

    fn engine(
        device: &<TestAutodiff as Backend>::Device,
    ) -> BurnEngine<
        TestAutodiff,
        PixelSigmoid<TestAutodiff>,
        impl Optimizer<PixelSigmoid<TestAutodiff>, TestAutodiff>,
    > {
        // Fixed weights so every engine starts identical.
        let mut linear: Linear<TestAutodiff> = LinearConfig::new(1, 1).init(device);
        linear.weight = Param::from_tensor(Tensor::from_data(
            TensorData::new(vec![0.3f32], [1, 1]),
            device,
        ));
        linear.bias = Some(Param::from_tensor(Tensor::zeros([1], device)));
        let model = PixelSigmoid { linear };
        BurnEngine::new(model, SgdConfig::new().init(), 0.1)
    }

    fn batch(device: &<TestAutodiff as Backend>::Device) -> Tensor<TestAutodiff, 4> {
        Tensor::from_data(TensorData::new(vec![0.5f32; 12], [1, 3, 2, 2]), device)
    }

    fn weight<O: Optimizer<PixelSigmoid<TestAutodiff>, TestAutodiff>>(
        engine: &BurnEngine<TestAutodiff, PixelSigmoid<TestAutodiff>, O>,
    ) -> Vec<f32> {
        engine
            .model()
            .linear
            .weight
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    fn one_iteration<O: Optimizer<PixelSigmoid<TestAutodiff>, TestAutodiff>>(
        engine: &mut BurnEngine<TestAutodiff, PixelSigmoid<TestAutodiff>, O>,
        zero: bool,
    ) {
        let device = Default::default();
        if zero {
            engine.zero_grad();
        }
        let out = engine.forward(batch(&device));
        engine.backward(out.fused().clone().mean());
        engine.step();
    }

    #[test]
    fn zeroed_gradients_make_updates_reproducible() {
        let device = Default::default();
        let mut a = engine(&device);
        let mut b = engine(&device);
        assert_eq!(weight(&a), weight(&b));

        one_iteration(&mut a, true);
        one_iteration(&mut b, true);
        assert_eq!(weight(&a), weight(&b));
    }

    #[test]
    fn missing_zero_grad_changes_the_update() {
        let device = Default::default();
        let mut zeroed = engine(&device);
        let mut stale = engine(&device);

        // Leave one unconsumed backward behind on both engines.
        for e in [&mut zeroed, &mut stale] {
            let out = e.forward(batch(&device));
            e.backward(out.fused().clone().mean());
        }
        one_iteration(&mut zeroed, true);
        one_iteration(&mut stale, false);
        assert_ne!(weight(&zeroed), weight(&stale));
    }

    #[test]
    fn unscale_detects_overflow() {
        let device = Default::default();
        let mut e = engine(&device);
        let out = e.forward(batch(&device));
        e.backward(out.fused().clone().mean().mul_scalar(f32::MAX));
        assert!(e.unscale_grads(f32::MAX));

        e.zero_grad();
        let out = e.forward(batch(&device));
        e.backward(out.fused().clone().mean().mul_scalar(4.0));
        assert!(!e.unscale_grads(0.25));
    }

    #[test]
    fn eval_forward_matches_training_forward_for_stateless_models() {
        let device = Default::default();
        let mut e = engine(&device);
        let train = e.forward(batch(&device)).fused().clone().into_data();
        e.eval();
        assert!(!e.is_training());
        let eval = e.forward(batch(&device)).fused().clone().into_data();
        assert_eq!(train, eval);
        e.train();
        assert!(e.is_training());
    }
}
