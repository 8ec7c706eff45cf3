//! End-to-end runs of the training loop against toy collaborators.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::{Device, Tensor, Var};
use tempfile::tempdir;

use acoustic_training::{
    AcousticModel, Batch, DataConfig, EncodedSentence, Example, LoggingConfig, Precision,
    ProgressProbe, SpeechDataset, Synthesis, TextFrontend, TrainingConfig, TrainingError,
    TrainingOrchestrator,
};

struct ToyModel {
    weight: Var,
    training: Arc<AtomicBool>,
}

impl ToyModel {
    fn new() -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(true)))
    }

    fn with_flag(training: Arc<AtomicBool>) -> Self {
        let tensor = Tensor::from_slice(&[0.5f32, -0.5, 0.25, 1.0], (4,), &Device::Cpu).unwrap();
        Self {
            weight: Var::from_tensor(&tensor).unwrap(),
            training,
        }
    }
}

impl AcousticModel for ToyModel {
    fn forward_train(&self, batch: &Batch) -> Result<Tensor, TrainingError> {
        // Quadratic in the weights, scaled by a batch statistic; smooth and
        // strictly positive so every step produces finite gradients.
        let scale = batch
            .targets
            .mean_all()
            .map_err(runtime)?
            .to_scalar::<f32>()
            .map_err(runtime)? as f64
            + 1.0;
        self.weight
            .as_tensor()
            .sqr()
            .map_err(runtime)?
            .sum_all()
            .map_err(runtime)?
            .affine(scale, 0.0)
            .map_err(runtime)
    }

    fn synthesize(
        &self,
        tokens: &Tensor,
        _conditioning: Option<&Tensor>,
    ) -> Result<Synthesis, TrainingError> {
        let token_count = tokens.dims1().map_err(runtime)?;
        let frames = token_count * 2;
        let spectrogram = Tensor::rand(0f32, 1f32, (frames, 8), &Device::Cpu).map_err(runtime)?;
        let durations =
            Tensor::from_vec(vec![2f32; token_count], token_count, &Device::Cpu).map_err(runtime)?;
        Ok(Synthesis {
            spectrogram,
            durations,
        })
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::SeqCst);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![("weight".to_string(), self.weight.clone())]
    }
}

struct ToyDataset {
    size: usize,
    conditioning: bool,
}

impl SpeechDataset for ToyDataset {
    fn len(&self) -> usize {
        self.size
    }

    fn get(&self, index: usize) -> Result<Example, TrainingError> {
        let tokens = 3 + index % 4;
        let frames = tokens * 2;
        Ok(Example {
            tokens: (1..=tokens as i64).collect(),
            targets: (0..frames).map(|f| vec![f as f32 * 0.1; 4]).collect(),
            durations: vec![2; tokens],
            energy: vec![0.5; frames],
            pitch: vec![0.25; frames],
            conditioning: self.conditioning.then(|| vec![0.1, 0.2]),
        })
    }
}

/// Delegates everything to the toy model but returns a NaN training loss,
/// so every backward pass produces non-finite gradients.
struct NonFiniteModel(ToyModel);

impl AcousticModel for NonFiniteModel {
    fn forward_train(&self, _batch: &Batch) -> Result<Tensor, TrainingError> {
        self.0
            .weight
            .as_tensor()
            .sum_all()
            .map_err(runtime)?
            .affine(f64::NAN, 0.0)
            .map_err(runtime)
    }

    fn synthesize(
        &self,
        tokens: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> Result<Synthesis, TrainingError> {
        self.0.synthesize(tokens, conditioning)
    }

    fn set_training(&self, training: bool) {
        self.0.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.0.is_training()
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.0.parameters()
    }
}

struct ToyFrontend;

impl TextFrontend for ToyFrontend {
    fn encode(&self, sentence: &str) -> Result<EncodedSentence, TrainingError> {
        let token_ids: Vec<i64> = sentence
            .chars()
            .filter(|c| c.is_alphabetic())
            .map(|c| c as i64)
            .collect();
        let phone_labels = token_ids.iter().map(|id| id.to_string()).collect();
        Ok(EncodedSentence {
            token_ids,
            phone_labels,
        })
    }
}

fn test_config(save_directory: PathBuf) -> TrainingConfig {
    TrainingConfig {
        save_directory,
        batch_size: 8,
        steps: 4,
        epochs_per_save: 1,
        use_conditioning: false,
        language: "en".to_string(),
        learning_rate: 1e-2,
        warmup_steps: 10,
        checkpoint_path: None,
        fine_tune: false,
        resume: false,
        keep_checkpoints: 5,
        seed: 42,
        precision: Precision::Fp32,
        data: DataConfig {
            num_workers: 2,
            prefetch_factor: 2,
        },
        logging: LoggingConfig {
            enable_stdout: false,
            tensorboard: None,
            tensorboard_flush_every_n: 20,
        },
    }
}

fn orchestrator(config: TrainingConfig) -> Result<TrainingOrchestrator, TrainingError> {
    TrainingOrchestrator::new(
        config,
        Box::new(ToyModel::new()),
        Arc::new(ToyDataset {
            size: 40,
            conditioning: false,
        }),
        Box::new(ToyFrontend),
        Device::Cpu,
    )
}

#[test]
fn one_save_cycle_produces_checkpoint_and_probe_artifact() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path().to_path_buf());

    // 40 records at batch size 8 is 5 steps per epoch; the budget of 4 is
    // first exceeded at the end of epoch 1, after the save.
    let mut trainer = orchestrator(config).unwrap();
    trainer.train().unwrap();

    assert_eq!(trainer.step_counter(), 5);
    assert!(dir.path().join("checkpoint_5.json").exists());
    assert!(dir.path().join("spec").join("5.png").exists());
}

#[test]
fn training_ends_in_evaluation_mode() {
    let dir = tempdir().unwrap();
    let flag = Arc::new(AtomicBool::new(true));
    let model = Box::new(ToyModel::with_flag(Arc::clone(&flag)));

    let mut trainer = TrainingOrchestrator::new(
        test_config(dir.path().to_path_buf()),
        model,
        Arc::new(ToyDataset {
            size: 40,
            conditioning: false,
        }),
        Box::new(ToyFrontend),
        Device::Cpu,
    )
    .unwrap();
    trainer.train().unwrap();

    // The final epoch switches to evaluation mode before saving and probing
    // and never switches back once the budget is exhausted.
    assert!(!flag.load(Ordering::SeqCst));
}

#[test]
fn long_run_prunes_to_the_newest_checkpoints() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path().to_path_buf());
    config.steps = 35;
    config.keep_checkpoints = 3;

    let mut trainer = orchestrator(config).unwrap();
    trainer.train().unwrap();

    // 5 steps per epoch; the budget of 35 is exceeded at step 40.
    assert_eq!(trainer.step_counter(), 40);
    let mut steps: Vec<usize> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            name.strip_prefix("checkpoint_")?
                .strip_suffix(".json")?
                .parse()
                .ok()
        })
        .collect();
    steps.sort();
    assert_eq!(steps, vec![30, 35, 40]);
}

#[test]
fn resume_with_empty_directory_fails_before_training() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path().to_path_buf());
    config.resume = true;

    let err = orchestrator(config)
        .err()
        .expect("resume without a checkpoint must fail");
    assert!(matches!(err, TrainingError::Initialization(_)));
}

#[test]
fn resume_restores_the_step_counter_and_learning_rate() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path().to_path_buf());

    let mut first = orchestrator(config.clone()).unwrap();
    first.train().unwrap();
    assert_eq!(first.step_counter(), 5);
    let expected_lr = first.current_learning_rate();
    drop(first);

    let mut resumed_config = config;
    resumed_config.resume = true;
    let resumed = orchestrator(resumed_config).unwrap();

    assert_eq!(resumed.step_counter(), 5);
    // Warmup position 5 of 10 puts the next update at half the base rate.
    assert_eq!(resumed.current_learning_rate(), expected_lr);
    assert_eq!(resumed.current_learning_rate(), 1e-2 * 0.5);
}

#[test]
fn fine_tune_starts_a_fresh_trajectory_at_a_reduced_rate() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path().to_path_buf());

    let mut first = orchestrator(config.clone()).unwrap();
    first.train().unwrap();
    drop(first);

    let fine_tune_dir = tempdir().unwrap();
    let mut fine_tune_config = test_config(fine_tune_dir.path().to_path_buf());
    fine_tune_config.fine_tune = true;
    fine_tune_config.checkpoint_path = Some(dir.path().join("checkpoint_5.json"));

    let trainer = orchestrator(fine_tune_config).unwrap();
    assert_eq!(trainer.step_counter(), 0);
    assert_eq!(trainer.base_learning_rate(), 1e-2 * 0.01);
    // Warmup restarts from zero alongside the optimizer.
    assert_eq!(trainer.current_learning_rate(), 0.0);
}

#[test]
fn non_finite_gradients_skip_updates_but_the_run_continues() {
    let dir = tempdir().unwrap();
    let model = NonFiniteModel(ToyModel::new());
    let weight = model.0.weight.clone();
    let initial = weight.as_tensor().to_vec1::<f32>().unwrap();

    let mut trainer = TrainingOrchestrator::new(
        test_config(dir.path().to_path_buf()),
        Box::new(model),
        Arc::new(ToyDataset {
            size: 40,
            conditioning: false,
        }),
        Box::new(ToyFrontend),
        Device::Cpu,
    )
    .unwrap();
    trainer.train().unwrap();

    // Every update was skipped, yet the counter and the save cadence ran
    // exactly as they would for a healthy loss.
    assert_eq!(trainer.step_counter(), 5);
    assert_eq!(weight.as_tensor().to_vec1::<f32>().unwrap(), initial);
    assert!(dir.path().join("checkpoint_5.json").exists());
}

#[test]
fn probe_reports_phone_labels_with_the_artifact() {
    let dir = tempdir().unwrap();
    let probe = ProgressProbe::new("en", dir.path(), Device::Cpu);
    let model = ToyModel::new();

    let report = probe.run(&model, &ToyFrontend, None, 3).unwrap();

    assert!(report.artifact.ends_with("spec/3.png"));
    assert!(report.artifact.exists());
    let letters = "This is an unseen sentence."
        .chars()
        .filter(|c| c.is_alphabetic())
        .count();
    assert_eq!(report.phone_labels.len(), letters);
}

#[test]
fn conditioned_run_probes_with_a_reference_vector() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path().to_path_buf());
    config.use_conditioning = true;

    let mut trainer = TrainingOrchestrator::new(
        config,
        Box::new(ToyModel::new()),
        Arc::new(ToyDataset {
            size: 40,
            conditioning: true,
        }),
        Box::new(ToyFrontend),
        Device::Cpu,
    )
    .unwrap();
    trainer.train().unwrap();
    assert!(dir.path().join("spec").join("5.png").exists());
}

#[test]
fn corrupt_checkpoint_path_is_rejected() {
    let dir = tempdir().unwrap();
    let bogus = dir.path().join("checkpoint_3.json");
    std::fs::write(&bogus, b"not json").unwrap();

    let mut config = test_config(dir.path().to_path_buf());
    config.checkpoint_path = Some(bogus);

    let err = orchestrator(config)
        .err()
        .expect("an unreadable checkpoint must fail construction");
    assert!(matches!(err, TrainingError::CorruptCheckpoint(_)));
}

fn runtime(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
