use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Accumulates per-step losses over one pass through the dataset, tracking
/// how many updates were applied and how many were skipped because the
/// gradients came back non-finite.
#[derive(Debug)]
pub struct EpochMetrics {
    started: Instant,
    loss_sum: f64,
    steps: usize,
    skipped_steps: usize,
    loss_ema: ExponentialMovingAverage,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            loss_sum: 0.0,
            steps: 0,
            skipped_steps: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, loss: f64, update_applied: bool) -> f64 {
        self.loss_sum += loss;
        self.steps += 1;
        if !update_applied {
            self.skipped_steps += 1;
        }
        self.loss_ema.update(loss)
    }

    pub fn finalize(self) -> EpochSummary {
        let mean_loss = if self.steps == 0 {
            0.0
        } else {
            self.loss_sum / self.steps as f64
        };
        EpochSummary {
            mean_loss,
            steps: self.steps,
            skipped_steps: self.skipped_steps,
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for EpochMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub mean_loss: f64,
    pub steps: usize,
    pub skipped_steps: usize,
    pub elapsed: Duration,
}
