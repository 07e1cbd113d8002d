use std::time::Duration;

/// Counters and running sums owned by the training loop.
///
/// The window fields (`window_iter` and the running sums) cover the
/// iterations since the last checkpoint; `epoch` and `global_iter` never reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationState {
    pub epoch: usize,
    pub global_iter: usize,
    pub window_iter: usize,
    pub running_loss: f64,
    pub running_tar_loss: f64,
    pub running_time: Duration,
}

impl IterationState {
    /// Start counting from an already completed iteration (resume).
    pub fn starting_at(global_iter: usize) -> Self {
        Self {
            global_iter,
            ..Default::default()
        }
    }

    pub fn record(&mut self, loss: f32, tar_loss: f32, elapsed: Duration) {
        self.global_iter += 1;
        self.window_iter += 1;
        self.running_loss += loss as f64;
        self.running_tar_loss += tar_loss as f64;
        self.running_time += elapsed;
    }

    pub fn reset_window(&mut self) {
        self.window_iter = 0;
        self.running_loss = 0.0;
        self.running_tar_loss = 0.0;
        self.running_time = Duration::ZERO;
    }

    fn per_iter(&self, total: f64) -> f64 {
        if self.window_iter == 0 {
            0.0
        } else {
            total / self.window_iter as f64
        }
    }

    pub fn mean_loss(&self) -> f64 {
        self.per_iter(self.running_loss)
    }

    pub fn mean_tar_loss(&self) -> f64 {
        self.per_iter(self.running_tar_loss)
    }

    /// Mean seconds spent in forward, loss and optimizer step.
    pub fn mean_step_time(&self) -> f64 {
        self.per_iter(self.running_time.as_secs_f64())
    }
}
