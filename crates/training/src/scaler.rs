//! Dynamic loss scaling for reduced-precision training.

use crate::error::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub enabled: bool,
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Consecutive overflow-free steps before the scale grows.
    pub growth_interval: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

impl ScalerConfig {
    pub fn validate(&self) -> TrainResult<()> {
        if !(self.init_scale.is_finite() && self.init_scale > 0.0) {
            return Err(TrainError::Configuration(format!(
                "loss scale must be positive, got {}",
                self.init_scale
            )));
        }
        if self.growth_factor <= 1.0 {
            return Err(TrainError::Configuration(format!(
                "scale growth factor must exceed 1, got {}",
                self.growth_factor
            )));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(TrainError::Configuration(format!(
                "scale backoff factor must be in (0, 1), got {}",
                self.backoff_factor
            )));
        }
        if self.growth_interval == 0 {
            return Err(TrainError::Configuration(
                "scale growth interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// What happened to the optimizer step this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// Gradients overflowed; the step was dropped and the scale backed off.
    Skipped,
}

/// Loss scaler state. It lives for the whole run and is not reset at checkpoints.
#[derive(Debug, Clone)]
pub struct DynamicLossScaler {
    cfg: ScalerConfig,
    scale: f32,
    growth_tracker: usize,
}

impl DynamicLossScaler {
    pub fn new(cfg: ScalerConfig) -> Self {
        let scale = if cfg.enabled { cfg.init_scale } else { 1.0 };
        Self {
            cfg,
            scale,
            growth_tracker: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn inv_scale(&self) -> f32 {
        1.0 / self.scale
    }

    /// Steps taken since the last overflow or growth.
    pub fn growth_tracker(&self) -> usize {
        self.growth_tracker
    }

    /// Record whether the unscaled gradients overflowed and adjust the scale.
    pub fn update(&mut self, found_overflow: bool) -> StepOutcome {
        if !self.cfg.enabled {
            return if found_overflow {
                StepOutcome::Skipped
            } else {
                StepOutcome::Applied
            };
        }
        if found_overflow {
            self.scale *= self.cfg.backoff_factor;
            self.growth_tracker = 0;
            tracing::debug!("gradient overflow, loss scale backed off to {}", self.scale);
            return StepOutcome::Skipped;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.cfg.growth_interval {
            let grown = self.scale * self.cfg.growth_factor;
            if grown.is_finite() {
                self.scale = grown;
            }
            self.growth_tracker = 0;
        }
        StepOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(growth_interval: usize) -> DynamicLossScaler {
        DynamicLossScaler::new(ScalerConfig {
            growth_interval,
            ..Default::default()
        })
    }

    #[test]
    fn overflow_halves_and_skips() {
        let mut s = scaler(3);
        assert_eq!(s.update(false), StepOutcome::Applied);
        assert_eq!(s.update(true), StepOutcome::Skipped);
        assert_eq!(s.scale(), 32768.0);
        assert_eq!(s.growth_tracker(), 0);
    }

    #[test]
    fn grows_after_interval_of_clean_steps() {
        let mut s = scaler(3);
        for _ in 0..2 {
            s.update(false);
        }
        assert_eq!(s.scale(), 65536.0);
        s.update(false);
        assert_eq!(s.scale(), 131072.0);
        assert_eq!(s.growth_tracker(), 0);
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let mut s = DynamicLossScaler::new(ScalerConfig {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(s.scale(), 1.0);
        assert_eq!(s.update(true), StepOutcome::Skipped);
        assert_eq!(s.scale(), 1.0);
    }

    #[test]
    fn invalid_factors_are_rejected() {
        let cfg = ScalerConfig {
            backoff_factor: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(ScalerConfig::default().validate().is_ok());
    }
}
