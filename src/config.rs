use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Full configuration surface of one training run. All knobs are supplied by
/// the caller; nothing is read interactively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Where checkpoints and progress artifacts are written.
    pub save_directory: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Total optimizer-step budget. The stop condition is only evaluated at
    /// save-cadence boundaries, so the run may overshoot by up to
    /// `epochs_per_save - 1` epochs.
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_epochs_per_save")]
    pub epochs_per_save: usize,
    #[serde(default)]
    pub use_conditioning: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Explicit snapshot to restore before training starts.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    /// Restore model parameters only and start a fresh optimizer trajectory
    /// at one hundredth of the configured learning rate.
    #[serde(default)]
    pub fine_tune: bool,
    /// Continue from the most recent checkpoint in `save_directory`. Fails
    /// when no checkpoint exists there.
    #[serde(default)]
    pub resume: bool,
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if self.steps == 0 {
            errors.push("steps must be greater than 0".to_string());
        }

        if self.epochs_per_save == 0 {
            errors.push("epochs_per_save must be greater than 0".to_string());
        }

        if self.learning_rate <= 0.0 {
            errors.push("learning_rate must be greater than 0".to_string());
        }

        if self.keep_checkpoints == 0 {
            errors.push("keep_checkpoints must be greater than 0".to_string());
        }

        if self.language.is_empty() {
            errors.push("language must not be empty".to_string());
        }

        if self.data.num_workers == 0 {
            errors.push("data.num_workers must be greater than 0".to_string());
        }

        if self.data.prefetch_factor == 0 {
            errors.push("data.prefetch_factor must be greater than 0".to_string());
        }

        if self.resume && self.checkpoint_path.is_some() {
            errors.push(
                "resume and checkpoint_path are mutually exclusive; resume scans save_directory"
                    .to_string(),
            );
        }

        if self.fine_tune && self.resume {
            errors.push("fine_tune cannot be combined with resume".to_string());
        }

        if self.fine_tune && self.checkpoint_path.is_none() {
            errors.push("fine_tune requires checkpoint_path".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.save_directory, base);
        if let Some(path) = self.checkpoint_path.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Background workers preparing batches concurrently with the main loop.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Bounded handoff capacity per worker; backpressure for the main loop.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            prefetch_factor: default_prefetch_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Mixed
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    32
}

fn default_steps() -> usize {
    300_000
}

fn default_epochs_per_save() -> usize {
    5
}

fn default_language() -> String {
    "en".to_string()
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_warmup_steps() -> usize {
    14_000
}

fn default_keep_checkpoints() -> usize {
    5
}

fn default_seed() -> u64 {
    42
}

fn default_num_workers() -> usize {
    8
}

fn default_prefetch_factor() -> usize {
    8
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush_every_n() -> usize {
    20
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    /// A batch mixed records with and without a conditioning vector.
    SchemaMismatch(String),
    /// A snapshot on disk could not be read back into a full training state.
    CorruptCheckpoint(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch(message.into())
    }

    pub fn corrupt_checkpoint(message: impl Into<String>) -> Self {
        Self::CorruptCheckpoint(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "io failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::SchemaMismatch(msg) => {
                write!(f, "batch schema mismatch: {}", msg)
            }
            TrainingError::CorruptCheckpoint(msg) => {
                write!(f, "corrupt checkpoint: {}", msg)
            }
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
