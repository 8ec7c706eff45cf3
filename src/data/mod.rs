//! Batching for variable-length speech data: collation with per-batch
//! padding and a bounded background prefetch pipeline.

use std::{
    collections::VecDeque,
    sync::{
        mpsc::{sync_channel, Receiver},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{model::SpeechDataset, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One training record. `targets` is `frames x mel_bins`; `durations` align
/// with `tokens`, `energy` and `pitch` align with the target frames. The
/// conditioning vector is the optional eighth field; every record of one run
/// either carries it or does not.
#[derive(Debug, Clone)]
pub struct Example {
    pub tokens: Vec<i64>,
    pub targets: Vec<Vec<f32>>,
    pub durations: Vec<i64>,
    pub energy: Vec<f32>,
    pub pitch: Vec<f32>,
    pub conditioning: Option<Vec<f32>>,
}

/// Collated form of N examples. Variable-length fields are padded with zeros
/// to the batch-local maximum along their time axis; length fields and the
/// conditioning vectors are stacked unmodified.
#[derive(Debug)]
pub struct Batch {
    pub tokens: Tensor,
    pub token_lengths: Tensor,
    pub targets: Tensor,
    pub target_lengths: Tensor,
    pub durations: Tensor,
    pub energy: Tensor,
    pub pitch: Tensor,
    pub conditioning: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tokens.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collates examples into one padded batch, preserving input order.
///
/// Fails with `SchemaMismatch` when records disagree on the presence of the
/// conditioning vector. Numeric content is not validated here.
pub fn collate(examples: &[Example], device: &Device) -> Result<Batch> {
    if examples.is_empty() {
        return Err(TrainingError::runtime("cannot collate an empty batch"));
    }

    let conditioning_dim = examples[0].conditioning.as_ref().map(Vec::len);
    for (index, example) in examples.iter().enumerate() {
        if example.conditioning.is_some() != conditioning_dim.is_some() {
            return Err(TrainingError::schema_mismatch(format!(
                "record {} {} a conditioning vector while record 0 {}",
                index,
                if example.conditioning.is_some() {
                    "carries"
                } else {
                    "lacks"
                },
                if conditioning_dim.is_some() {
                    "carries one"
                } else {
                    "does not"
                },
            )));
        }
        if let (Some(vector), Some(dim)) = (&example.conditioning, conditioning_dim) {
            if vector.len() != dim {
                return Err(TrainingError::schema_mismatch(format!(
                    "record {} carries a {}-dimensional conditioning vector while record 0 carries {} dimensions",
                    index,
                    vector.len(),
                    dim
                )));
            }
        }
    }

    let n = examples.len();
    let max_tokens = examples.iter().map(|ex| ex.tokens.len()).max().unwrap_or(0);
    let max_frames = examples
        .iter()
        .map(|ex| ex.targets.len())
        .max()
        .unwrap_or(0);
    let max_durations = examples
        .iter()
        .map(|ex| ex.durations.len())
        .max()
        .unwrap_or(0);
    let max_energy = examples.iter().map(|ex| ex.energy.len()).max().unwrap_or(0);
    let max_pitch = examples.iter().map(|ex| ex.pitch.len()).max().unwrap_or(0);
    let mel_bins = examples[0]
        .targets
        .first()
        .map(|frame| frame.len())
        .unwrap_or(0);

    let mut tokens = Vec::with_capacity(n * max_tokens);
    let mut token_lengths = Vec::with_capacity(n);
    let mut targets = Vec::with_capacity(n * max_frames * mel_bins);
    let mut target_lengths = Vec::with_capacity(n);
    let mut durations = Vec::with_capacity(n * max_durations);
    let mut energy = Vec::with_capacity(n * max_energy);
    let mut pitch = Vec::with_capacity(n * max_pitch);
    let mut conditioning = Vec::new();

    for example in examples {
        token_lengths.push(example.tokens.len() as i64);
        tokens.extend_from_slice(&example.tokens);
        tokens.extend(std::iter::repeat(0i64).take(max_tokens - example.tokens.len()));

        target_lengths.push(example.targets.len() as i64);
        for frame in &example.targets {
            targets.extend_from_slice(frame);
        }
        let pad_frames = max_frames - example.targets.len();
        targets.extend(std::iter::repeat(0f32).take(pad_frames * mel_bins));

        durations.extend_from_slice(&example.durations);
        durations.extend(std::iter::repeat(0i64).take(max_durations - example.durations.len()));

        energy.extend_from_slice(&example.energy);
        energy.extend(std::iter::repeat(0f32).take(max_energy - example.energy.len()));

        pitch.extend_from_slice(&example.pitch);
        pitch.extend(std::iter::repeat(0f32).take(max_pitch - example.pitch.len()));

        if let Some(vector) = &example.conditioning {
            conditioning.extend_from_slice(vector);
        }
    }

    let conditioning = match conditioning_dim {
        Some(dim) => {
            Some(Tensor::from_vec(conditioning, (n, dim), device).map_err(tensor_error)?)
        }
        None => None,
    };

    Ok(Batch {
        tokens: Tensor::from_vec(tokens, (n, max_tokens), device).map_err(tensor_error)?,
        token_lengths: Tensor::from_vec(token_lengths, (n,), device).map_err(tensor_error)?,
        targets: Tensor::from_vec(targets, (n, max_frames, mel_bins), device)
            .map_err(tensor_error)?,
        target_lengths: Tensor::from_vec(target_lengths, (n,), device).map_err(tensor_error)?,
        durations: Tensor::from_vec(durations, (n, max_durations), device)
            .map_err(tensor_error)?,
        energy: Tensor::from_vec(energy, (n, max_energy), device).map_err(tensor_error)?,
        pitch: Tensor::from_vec(pitch, (n, max_pitch), device).map_err(tensor_error)?,
        conditioning,
    })
}

fn tensor_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(format!("failed to materialize batch tensor: {}", err))
}

/// One shuffled pass over the dataset, prepared by a pool of background
/// workers. Workers pull index chunks from a shared queue, fetch and collate
/// examples, and hand finished batches through a bounded channel; a batch,
/// once received, is owned exclusively by the caller. Only full batches are
/// produced; the shuffled remainder is dropped.
///
/// Workers exit once the queue drains or the receiving side goes away.
pub struct BatchStream {
    receiver: Receiver<Result<Batch>>,
    _workers: Vec<JoinHandle<()>>,
}

impl BatchStream {
    pub fn spawn(
        dataset: Arc<dyn SpeechDataset>,
        device: Device,
        batch_size: usize,
        num_workers: usize,
        prefetch_factor: usize,
        epoch_seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch_size must be greater than zero",
            ));
        }

        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(epoch_seed);
        indices.shuffle(&mut rng);

        let chunks: VecDeque<Vec<usize>> = indices
            .chunks_exact(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let queue = Arc::new(Mutex::new(chunks));

        let num_workers = num_workers.max(1);
        let capacity = prefetch_factor.max(1) * num_workers;
        let (sender, receiver) = sync_channel(capacity);

        let workers = (0..num_workers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let dataset = Arc::clone(&dataset);
                let sender = sender.clone();
                let device = device.clone();
                thread::spawn(move || loop {
                    let chunk = match queue.lock() {
                        Ok(mut guard) => guard.pop_front(),
                        Err(_) => break,
                    };
                    let Some(chunk) = chunk else {
                        break;
                    };
                    let batch = fetch_and_collate(dataset.as_ref(), &chunk, &device);
                    let failed = batch.is_err();
                    if sender.send(batch).is_err() || failed {
                        break;
                    }
                })
            })
            .collect();

        Ok(Self {
            receiver,
            _workers: workers,
        })
    }

    /// Blocks until the next batch is ready; `None` once the pass is over.
    pub fn next(&mut self) -> Option<Result<Batch>> {
        self.receiver.recv().ok()
    }
}

fn fetch_and_collate(
    dataset: &dyn SpeechDataset,
    indices: &[usize],
    device: &Device,
) -> Result<Batch> {
    let mut examples = Vec::with_capacity(indices.len());
    for &index in indices {
        examples.push(dataset.get(index)?);
    }
    collate(&examples, device)
}
