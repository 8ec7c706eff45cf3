//! Step-indexed learning-rate warmup.

use serde::{Deserialize, Serialize};

/// Linear warmup multiplier, capped at 1.0 once `warmup_steps` optimizer
/// steps have been taken. The multiplier is a pure function of
/// `current_step`, so persisting `current_step` alone is enough to reproduce
/// the exact learning rate after a restart.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    warmup_steps: usize,
    current_step: usize,
}

/// Serialized scheduler state; exactly the step index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerState {
    pub current_step: usize,
}

impl WarmupSchedule {
    pub fn new(warmup_steps: usize) -> Self {
        Self {
            warmup_steps,
            current_step: 0,
        }
    }

    /// Advances the step index by one.
    pub fn advance(&mut self) {
        self.current_step = self.current_step.saturating_add(1);
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Active multiplier: `min(1.0, current_step / warmup_steps)`. A warmup
    /// of zero steps means no ramp at all.
    pub fn multiplier(&self) -> f64 {
        if self.warmup_steps == 0 {
            return 1.0;
        }
        (self.current_step as f64 / self.warmup_steps as f64).min(1.0)
    }

    pub fn apply(&self, base_lr: f64) -> f64 {
        base_lr * self.multiplier()
    }

    pub fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            current_step: self.current_step,
        }
    }

    pub fn restore(&mut self, state: SchedulerState) {
        self.current_step = state.current_step;
    }
}
