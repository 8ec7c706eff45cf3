//! End-of-epoch synthesis probe. Renders the model's current output for a
//! fixed held-out sentence to a PNG so progress can be judged by eye across
//! checkpoints.

use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};

use crate::{
    model::{AcousticModel, TextFrontend},
    TrainingError,
};

const BOUNDARY_COLOR: Rgb<u8> = Rgb([220, 40, 40]);

/// Fixed sentence per language; never drawn from the training data.
pub fn probe_sentence(language: &str) -> &'static str {
    match language {
        "en" => "This is an unseen sentence.",
        "de" => "Dies ist ein ungesehener Satz.",
        _ => "Hello",
    }
}

pub struct ProgressProbe {
    sentence: String,
    output_directory: PathBuf,
    device: Device,
}

/// Outcome of one probe run. The raster backend cannot draw glyphs, so the
/// phone labels travel alongside the artifact path for the caller to log.
pub struct ProbeReport {
    pub artifact: PathBuf,
    pub phone_labels: Vec<String>,
}

impl ProgressProbe {
    pub fn new(language: &str, save_directory: &Path, device: Device) -> Self {
        Self {
            sentence: probe_sentence(language).to_string(),
            output_directory: save_directory.join("spec"),
            device,
        }
    }

    pub fn sentence(&self) -> &str {
        &self.sentence
    }

    /// Synthesizes the probe sentence and writes the spectrogram image as
    /// `<save_directory>/spec/<step>.png`. The model is expected to already
    /// be in evaluation mode.
    pub fn run(
        &self,
        model: &dyn AcousticModel,
        frontend: &dyn TextFrontend,
        conditioning: Option<&Tensor>,
        step: usize,
    ) -> Result<ProbeReport, TrainingError> {
        let encoded = frontend.encode(&self.sentence)?;
        if encoded.token_ids.is_empty() {
            return Err(TrainingError::runtime(
                "text front end produced an empty token sequence for the probe sentence",
            ));
        }
        let tokens = Tensor::from_vec(
            encoded.token_ids.clone(),
            encoded.token_ids.len(),
            &self.device,
        )
        .map_err(to_runtime_error)?;

        let synthesis = model.synthesize(&tokens, conditioning)?;

        let spectrogram = tensor_to_rows(&synthesis.spectrogram)?;
        let durations = synthesis
            .durations
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .flatten_all()
            .map_err(to_runtime_error)?
            .to_vec1::<f32>()
            .map_err(to_runtime_error)?;

        fs::create_dir_all(&self.output_directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create probe directory {}: {err}",
                self.output_directory.display()
            ))
        })?;
        let path = self.output_directory.join(format!("{step}.png"));
        render_spectrogram(&spectrogram, &durations, &path)?;
        Ok(ProbeReport {
            artifact: path,
            phone_labels: encoded.phone_labels,
        })
    }
}

/// Extracts a `frames x mel_bins` tensor as row-major f32 rows.
fn tensor_to_rows(tensor: &Tensor) -> Result<Vec<Vec<f32>>, TrainingError> {
    let tensor = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
    match tensor.dims() {
        [_, _] => tensor.to_vec2::<f32>().map_err(to_runtime_error),
        dims => Err(TrainingError::runtime(format!(
            "expected a 2-dimensional spectrogram, got shape {dims:?}"
        ))),
    }
}

/// Draws the spectrogram with time on the horizontal axis, low mel bins at
/// the bottom, and a vertical marker at each cumulative-duration token
/// boundary.
fn render_spectrogram(
    rows: &[Vec<f32>],
    durations: &[f32],
    path: &Path,
) -> Result<(), TrainingError> {
    let frames = rows.len();
    let mel_bins = rows.first().map(|row| row.len()).unwrap_or(0);
    if frames == 0 || mel_bins == 0 {
        return Err(TrainingError::runtime(
            "cannot render an empty spectrogram",
        ));
    }

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for row in rows {
        for &value in row {
            if value.is_finite() {
                min = min.min(value);
                max = max.max(value);
            }
        }
    }
    let range = if max > min { max - min } else { 1.0 };

    let mut img = RgbImage::new(frames as u32, mel_bins as u32);
    for (frame, row) in rows.iter().enumerate() {
        for (bin, &value) in row.iter().enumerate() {
            let normalized = if value.is_finite() {
                (value - min) / range
            } else {
                0.0
            };
            let level = (normalized.clamp(0.0, 1.0) * 255.0) as u8;
            let y = (mel_bins - 1 - bin) as u32;
            img.put_pixel(frame as u32, y, Rgb([level, level, level]));
        }
    }

    // Token boundaries at the cumulative sum of predicted durations.
    let mut boundary = 0.0f32;
    for &duration in durations {
        boundary += duration.max(0.0);
        let column = boundary.round() as usize;
        if column == 0 || column >= frames {
            continue;
        }
        for y in 0..mel_bins as u32 {
            img.put_pixel(column as u32, y, BOUNDARY_COLOR);
        }
    }

    img.save(path).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
