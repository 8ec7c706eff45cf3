//! The resumable training loop. Owns the optimizer, gradient scaler, warmup
//! schedule, and step counter, and drives them through shuffled epochs with
//! periodic checkpointing and synthesis probes.

use std::{fs, path::PathBuf, sync::Arc};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};

use crate::{
    checkpoint::{self, TrainingSnapshot, CHECKPOINT_VERSION},
    data::{Batch, BatchStream},
    logging::{Logger, LoggingSettings},
    metrics::EpochMetrics,
    model::{AcousticModel, SpeechDataset, TextFrontend},
    optimizer::{Adam, AdamConfig, GradientScaler},
    probe::ProgressProbe,
    scheduler::WarmupSchedule,
    TrainingConfig, TrainingError,
};

const MAX_GRAD_NORM: f64 = 1.0;
const FINE_TUNE_LR_FACTOR: f64 = 0.01;

pub struct TrainingOrchestrator {
    config: TrainingConfig,
    model: Box<dyn AcousticModel>,
    dataset: Arc<dyn SpeechDataset>,
    frontend: Box<dyn TextFrontend>,
    device: Device,
    parameters: Vec<(String, Var)>,
    optimizer: Adam,
    scaler: GradientScaler,
    schedule: WarmupSchedule,
    probe: ProgressProbe,
    logger: Logger,
    base_learning_rate: f64,
    step_counter: usize,
}

impl TrainingOrchestrator {
    /// Builds the full training state and runs the restore protocol before
    /// any batch is touched. With `resume` set, the most recent checkpoint in
    /// the save directory is mandatory; with `checkpoint_path` set, that
    /// snapshot restores either everything or, under `fine_tune`, the model
    /// weights alone with a fresh trajectory at a reduced learning rate.
    pub fn new(
        config: TrainingConfig,
        model: Box<dyn AcousticModel>,
        dataset: Arc<dyn SpeechDataset>,
        frontend: Box<dyn TextFrontend>,
        device: Device,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        if dataset.len() < config.batch_size {
            return Err(TrainingError::initialization(format!(
                "dataset holds {} records, fewer than one batch of {}",
                dataset.len(),
                config.batch_size
            )));
        }

        fs::create_dir_all(&config.save_directory).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create save directory {}: {err}",
                config.save_directory.display()
            ))
        })?;

        let mut logger = Logger::new(LoggingSettings::from_config(
            config.logging.enable_stdout,
            config.logging.tensorboard.clone(),
            config.logging.tensorboard_flush_every_n,
        ))?;

        let base_learning_rate = if config.fine_tune {
            config.learning_rate * FINE_TUNE_LR_FACTOR
        } else {
            config.learning_rate
        };

        let parameters = model.parameters();
        let mut optimizer = Adam::new(
            parameters.clone(),
            AdamConfig::with_learning_rate(base_learning_rate),
        )?;
        let mut scaler = GradientScaler::new(config.precision);
        let mut schedule = WarmupSchedule::new(config.warmup_steps);
        let mut step_counter = 0;

        let restore_path = if config.resume {
            match checkpoint::most_recent(&config.save_directory)? {
                Some(path) => Some(path),
                None => {
                    return Err(TrainingError::initialization(format!(
                        "resume requested but {} holds no checkpoint",
                        config.save_directory.display()
                    )));
                }
            }
        } else {
            config.checkpoint_path.clone()
        };

        if let Some(path) = restore_path {
            let snapshot = checkpoint::load(&path)?;
            checkpoint::apply_model_parameters(model.as_ref(), &snapshot.model)?;
            if config.fine_tune {
                logger.log_message(&format!(
                    "loaded weights from {} for fine-tuning at lr {:.3e}",
                    path.display(),
                    base_learning_rate
                ));
            } else {
                optimizer.load_state(snapshot.optimizer)?;
                scaler.load_state(snapshot.scaler);
                schedule.restore(snapshot.scheduler);
                step_counter = snapshot.step_counter;
                if checkpoint::fingerprint_config(&config)? != snapshot.config_sha256 {
                    logger.log_message(
                        "warning: configuration differs from the run that wrote this checkpoint",
                    );
                }
                logger.log_message(&format!(
                    "restored training state from {} at step {}",
                    path.display(),
                    step_counter
                ));
            }
        }

        let probe = ProgressProbe::new(&config.language, &config.save_directory, device.clone());

        Ok(Self {
            config,
            model,
            dataset,
            frontend,
            device,
            parameters,
            optimizer,
            scaler,
            schedule,
            probe,
            logger,
            base_learning_rate,
            step_counter,
        })
    }

    pub fn step_counter(&self) -> usize {
        self.step_counter
    }

    /// The optimizer's unscheduled learning rate. Already reduced when
    /// fine-tuning.
    pub fn base_learning_rate(&self) -> f64 {
        self.base_learning_rate
    }

    /// Learning rate the next optimizer step will use.
    pub fn current_learning_rate(&self) -> f64 {
        self.schedule.apply(self.base_learning_rate)
    }

    /// Runs epochs until the step budget is exhausted. The budget is only
    /// checked at save-cadence boundaries, right after a checkpoint landed,
    /// so the final state on disk always covers every step taken.
    pub fn train(&mut self) -> Result<(), TrainingError> {
        let conditioning = self.reference_conditioning()?;
        self.model.set_training(true);

        let mut epoch = 0usize;
        loop {
            epoch += 1;
            let mut metrics = EpochMetrics::new();
            let mut stream = BatchStream::spawn(
                Arc::clone(&self.dataset),
                self.device.clone(),
                self.config.batch_size,
                self.config.data.num_workers,
                self.config.data.prefetch_factor,
                self.config.seed.wrapping_add(epoch as u64),
            )?;

            while let Some(batch) = stream.next() {
                let batch = batch?;
                self.train_step(&batch, &mut metrics)?;
            }

            self.model.set_training(false);
            let summary = metrics.finalize();
            self.logger.log_epoch(
                self.step_counter,
                self.current_learning_rate(),
                self.scaler.loss_scale(),
                &summary,
            );

            let mut budget_exhausted = false;
            if epoch % self.config.epochs_per_save == 0 {
                let path = self.save_checkpoint()?;
                self.logger.log_checkpoint(self.step_counter, &path);
                checkpoint::prune(&self.config.save_directory, self.config.keep_checkpoints)?;
                let report = self.probe.run(
                    self.model.as_ref(),
                    self.frontend.as_ref(),
                    conditioning.as_ref(),
                    self.step_counter,
                )?;
                self.logger.log_message(&format!(
                    "probe step={} path={} phones=[{}]",
                    self.step_counter,
                    report.artifact.display(),
                    report.phone_labels.join(" ")
                ));
                budget_exhausted = self.step_counter > self.config.steps;
            }

            self.device.synchronize().map_err(to_runtime_error)?;

            if budget_exhausted {
                self.logger.flush();
                return Ok(());
            }
            self.model.set_training(true);
        }
    }

    fn train_step(
        &mut self,
        batch: &Batch,
        metrics: &mut EpochMetrics,
    ) -> Result<(), TrainingError> {
        let loss = self.model.forward_train(batch)?;
        let loss_value = loss
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .to_scalar::<f32>()
            .map_err(to_runtime_error)? as f64;

        let scaled = self.scaler.scale(&loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;

        let found_inf = self.prepare_gradients(&mut grads)?;
        if found_inf {
            self.optimizer.zero_grad(&mut grads);
        } else {
            self.optimizer
                .set_learning_rate(self.schedule.apply(self.base_learning_rate));
            self.optimizer.step(&mut grads)?;
        }

        self.scaler.update(found_inf);
        self.schedule.advance();
        // Counts every batch consumed, including skipped updates, so the
        // checkpoint cadence and the step budget stay in data terms.
        self.step_counter += 1;
        metrics.record_step(loss_value, !found_inf);
        Ok(())
    }

    /// Unscales every gradient, measures the global norm, and clips it to
    /// `MAX_GRAD_NORM`. Returns true when any gradient came back non-finite,
    /// in which case the pending update must be skipped.
    fn prepare_gradients(&self, grads: &mut GradStore) -> Result<bool, TrainingError> {
        let mut unscaled = Vec::with_capacity(self.parameters.len());
        let mut squared_sum = 0f64;

        for (_, var) in &self.parameters {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let grad = self
                    .scaler
                    .unscale(&grad)?
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                let contribution = grad
                    .sqr()
                    .map_err(to_runtime_error)?
                    .sum_all()
                    .map_err(to_runtime_error)?
                    .to_scalar::<f32>()
                    .map_err(to_runtime_error)? as f64;
                squared_sum += contribution;
                unscaled.push((var, grad));
            }
        }

        let norm = squared_sum.sqrt();
        if !norm.is_finite() {
            return Ok(true);
        }

        let clip = if norm > MAX_GRAD_NORM {
            MAX_GRAD_NORM / (norm + 1e-6)
        } else {
            1.0
        };
        for (var, grad) in unscaled {
            let grad = if clip < 1.0 {
                grad.affine(clip, 0.0).map_err(to_runtime_error)?
            } else {
                grad
            };
            grads.insert(var.as_tensor(), grad);
        }

        Ok(false)
    }

    fn save_checkpoint(&mut self) -> Result<PathBuf, TrainingError> {
        let snapshot = TrainingSnapshot {
            version: CHECKPOINT_VERSION,
            config_sha256: checkpoint::fingerprint_config(&self.config)?,
            model: checkpoint::collect_model_parameters(self.model.as_ref())?,
            optimizer: self.optimizer.state()?,
            scaler: self.scaler.state(),
            scheduler: self.schedule.snapshot(),
            step_counter: self.step_counter,
        };
        checkpoint::save(&snapshot, &self.config.save_directory, self.step_counter)
    }

    /// A fixed conditioning vector for the probe, taken from record zero of
    /// the dataset when the run trains a conditioned model.
    fn reference_conditioning(&self) -> Result<Option<Tensor>, TrainingError> {
        if !self.config.use_conditioning {
            return Ok(None);
        }
        let example = self.dataset.get(0)?;
        let vector = example.conditioning.ok_or_else(|| {
            TrainingError::runtime(
                "use_conditioning is set but record 0 carries no conditioning vector",
            )
        })?;
        let dim = vector.len();
        Tensor::from_vec(vector, dim, &self.device)
            .map(Some)
            .map_err(to_runtime_error)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
