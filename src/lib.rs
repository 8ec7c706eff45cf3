//! Resumable training loop for sequence-to-spectrogram acoustic models.
//!
//! The crate orchestrates training around three collaborators supplied by
//! the caller: an [`AcousticModel`], a [`SpeechDataset`], and a
//! [`TextFrontend`]. Everything the loop owns, the optimizer trajectory,
//! the loss scale, the warmup position, and the step counter, round-trips
//! through single-file JSON checkpoints so a restarted run continues as if
//! it had never stopped.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod probe;
pub mod scheduler;
pub mod trainer;

pub use config::{DataConfig, LoggingConfig, Precision, TrainingConfig, TrainingError};
pub use data::{collate, Batch, BatchStream, Example};
pub use model::{AcousticModel, EncodedSentence, SpeechDataset, Synthesis, TextFrontend};
pub use probe::{probe_sentence, ProbeReport, ProgressProbe};
pub use scheduler::WarmupSchedule;
pub use trainer::TrainingOrchestrator;
