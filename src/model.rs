//! Contracts of the external collaborators this crate orchestrates but does
//! not implement: the acoustic model, the dataset, and the text front end.

use candle_core::{Tensor, Var};

use crate::{data::Batch, TrainingError};

/// Output of the model's single-sequence inference entry point.
pub struct Synthesis {
    /// Predicted spectrogram, `frames x mel_bins`.
    pub spectrogram: Tensor,
    /// Predicted per-token durations in frames, `(tokens,)`.
    pub durations: Tensor,
}

/// Opaque differentiable model. The trainer only needs a scalar training
/// loss, an inference entry point for the progress probe, and access to the
/// named parameters it updates.
///
/// The train/eval mode flag is shared mutable state behind `&self`; the
/// orchestrator toggles it at epoch boundaries and after probing.
pub trait AcousticModel: Send {
    /// Training-mode forward pass over a padded batch, returning a scalar
    /// loss tensor that supports backpropagation.
    fn forward_train(&self, batch: &Batch) -> Result<Tensor, TrainingError>;

    /// Inference for one token sequence, optionally conditioned. Runs
    /// without gradient tracking.
    fn synthesize(
        &self,
        tokens: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> Result<Synthesis, TrainingError>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Named trainable parameters, stable across calls.
    fn parameters(&self) -> Vec<(String, Var)>;
}

/// Indexable, length-reporting collection of training records.
pub trait SpeechDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<crate::data::Example, TrainingError>;
}

/// A probe sentence after phonemization.
pub struct EncodedSentence {
    pub token_ids: Vec<i64>,
    pub phone_labels: Vec<String>,
}

/// Text-to-phoneme front end, used only to encode the fixed probe sentence.
pub trait TextFrontend {
    fn encode(&self, sentence: &str) -> Result<EncodedSentence, TrainingError>;
}
