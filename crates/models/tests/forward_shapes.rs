use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Distribution, Tensor};
use models::prelude::*;

type TestBackend = NdArray<f32>;
type TestAutodiff = Autodiff<TestBackend>;

#[test]
fn light_model_yields_seven_maps_at_input_size() {
    let device = Default::default();
    let model = U2NetConfig::light().init::<TestBackend>(&device);
    let input = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);

    let out = model.forward_sides(input);
    assert_eq!(out.maps.len(), SIDE_OUTPUTS);
    for map in out.iter() {
        assert_eq!(map.dims(), [2, 1, 32, 32]);
        let lo = map.clone().min().into_scalar();
        let hi = map.clone().max().into_scalar();
        assert!(lo > 0.0 && hi < 1.0, "map outside (0, 1): [{lo}, {hi}]");
    }
}

#[test]
fn non_square_inputs_are_restored() {
    let device = Default::default();
    let model = U2NetConfig::light()
        .with_quant_backend(QuantBackend::Qnnpack)
        .init::<TestBackend>(&device);
    let input = Tensor::<TestBackend, 4>::ones([1, 3, 48, 32], &device);
    let out = model.forward(input);
    assert_eq!(out.fused().dims(), [1, 1, 48, 32]);
}

#[test]
fn gradients_flow_back_to_the_input() {
    let device = Default::default();
    let model = U2NetConfig::light().init::<TestAutodiff>(&device);
    let input = Tensor::<TestAutodiff, 4>::random([1, 3, 32, 32], Distribution::Default, &device)
        .require_grad();

    let out = model.forward_sides(input.clone());
    let loss = out
        .maps
        .into_iter()
        .map(|m| m.mean())
        .reduce(|a, b| a + b)
        .expect("seven maps");
    let grads = loss.backward();

    let grad = input.grad(&grads).expect("input gradient");
    assert_eq!(grad.dims(), [1, 3, 32, 32]);
    assert!(grad.abs().sum().into_scalar() > 0.0);
}
