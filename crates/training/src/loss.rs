//! Seven-way binary cross-entropy fusion over the side outputs.

use crate::error::{TrainError, TrainResult};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use models::{SideOutputs, SIDE_OUTPUTS};

/// Aggregated loss of one forward pass.
#[derive(Debug, Clone)]
pub struct FusedLoss<B: Backend> {
    /// Sum of all components; the tensor that is backpropagated.
    pub total: Tensor<B, 1>,
    /// Per-depth BCE, index 0 being the fused output.
    pub components: [f32; SIDE_OUTPUTS],
}

impl<B: Backend> FusedLoss<B> {
    /// Loss of the finest (fused) output.
    pub fn target(&self) -> f32 {
        self.components[0]
    }

    pub fn total_value(&self) -> f32 {
        self.total.clone().into_scalar().elem::<f32>()
    }
}

/// Mean BCE of `pred` against `label`; `pred` must already lie in (0, 1).
pub fn bce_mean<B: Backend>(pred: Tensor<B, 4>, label: Tensor<B, 4>) -> Tensor<B, 1> {
    let pos = label.clone() * pred.clone().log();
    let neg = label.neg().add_scalar(1.0) * pred.neg().add_scalar(1.0).log();
    (pos + neg).neg().mean()
}

fn check_range<B: Backend>(depth: usize, pred: &Tensor<B, 4>) -> TrainResult<()> {
    let pred = pred.clone().detach();
    let sum = pred.clone().sum().into_scalar().elem::<f32>();
    if !sum.is_finite() {
        return Err(TrainError::Numeric(format!(
            "prediction d{depth} contains non-finite values"
        )));
    }
    let lo = pred.clone().min().into_scalar().elem::<f32>();
    let hi = pred.max().into_scalar().elem::<f32>();
    if lo <= 0.0 || hi >= 1.0 {
        return Err(TrainError::Numeric(format!(
            "prediction d{depth} outside (0, 1): min={lo} max={hi}"
        )));
    }
    Ok(())
}

/// Combine the seven per-depth losses and log them.
pub fn fused_bce_loss<B: Backend>(
    outputs: &SideOutputs<B>,
    labels: &Tensor<B, 4>,
) -> TrainResult<FusedLoss<B>> {
    let mut components = [0.0f32; SIDE_OUTPUTS];
    let mut total: Option<Tensor<B, 1>> = None;
    for (depth, pred) in outputs.iter().enumerate() {
        if pred.dims() != labels.dims() {
            return Err(TrainError::Numeric(format!(
                "prediction d{depth} has shape {:?}, label has {:?}",
                pred.dims(),
                labels.dims()
            )));
        }
        check_range(depth, pred)?;
        let loss = bce_mean(pred.clone(), labels.clone());
        components[depth] = loss.clone().into_scalar().elem::<f32>();
        total = Some(match total {
            Some(acc) => acc + loss,
            None => loss,
        });
    }
    let total = total.ok_or_else(|| TrainError::Numeric("no predictions to score".into()))?;
    tracing::info!(
        "l0: {:.6}, l1: {:.6}, l2: {:.6}, l3: {:.6}, l4: {:.6}, l5: {:.6}, l6: {:.6}",
        components[0],
        components[1],
        components[2],
        components[3],
        components[4],
        components[5],
        components[6]
    );
    Ok(FusedLoss { total, components })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn constant(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::full([1, 1, 2, 2], value, &Default::default())
    }

    fn outputs(values: [f32; SIDE_OUTPUTS]) -> SideOutputs<TestBackend> {
        SideOutputs::new(values.map(constant))
    }

    #[test]
    fn total_equals_sum_of_components() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 1.0, 0.0], [1, 1, 2, 2]),
            &device,
        );
        let loss = fused_bce_loss(&outputs([0.5, 0.1, 0.9, 0.3, 0.7, 0.2, 0.8]), &labels).unwrap();
        let sum: f32 = loss.components.iter().sum();
        assert!((loss.total_value() - sum).abs() < 1e-5);
        assert!((loss.target() - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn prediction_at_one_is_rejected() {
        let labels = constant(1.0);
        let err = fused_bce_loss(&outputs([0.5, 0.5, 0.5, 1.0, 0.5, 0.5, 0.5]), &labels)
            .unwrap_err();
        match err {
            TrainError::Numeric(msg) => assert!(msg.contains("d3"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn nan_prediction_is_rejected() {
        let labels = constant(0.0);
        let result = fused_bce_loss(
            &outputs([f32::NAN, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5]),
            &labels,
        );
        assert!(matches!(result, Err(TrainError::Numeric(_))));
    }

    #[test]
    fn zero_prediction_is_rejected() {
        let labels = constant(0.0);
        let result = fused_bce_loss(&outputs([0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.0]), &labels);
        assert!(matches!(result, Err(TrainError::Numeric(_))));
    }
}
