use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Dynamic loss scaler for reduced-precision training. Disabled for plain
/// fp32 runs, where scale and unscale are identity operations.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

/// Serialized scaler state persisted inside checkpoints. A disabled scaler
/// round-trips as scale 1 with no stable-step history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradientScalerState {
    pub loss_scale: f32,
    pub stable_steps: usize,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        let enabled = matches!(
            precision,
            Precision::Fp16 | Precision::Bf16 | Precision::Mixed
        );
        if !enabled {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let cfg = sanitize_config(config);
        let state = EnabledState {
            loss_scale: cfg.initial_scale,
            stable_steps: 0,
            config: cfg,
        };
        Self {
            state: ScalerState::Enabled(state),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => {
                let scale = 1.0 / state.loss_scale;
                tensor.affine(scale as f64, 0.0).map_err(to_runtime_error)
            }
        }
    }

    /// Backs off on overflow, grows after a run of stable steps.
    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        match &self.state {
            ScalerState::Disabled => GradientScalerState {
                loss_scale: 1.0,
                stable_steps: 0,
            },
            ScalerState::Enabled(state) => GradientScalerState {
                loss_scale: state.loss_scale,
                stable_steps: state.stable_steps,
            },
        }
    }

    pub fn load_state(&mut self, snapshot: GradientScalerState) {
        if let ScalerState::Enabled(state) = &mut self.state {
            state.loss_scale = snapshot
                .loss_scale
                .clamp(state.config.min_scale, state.config.max_scale);
            state.stable_steps = snapshot.stable_steps;
        }
    }
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
