//! On-disk snapshots of the full training state.
//!
//! One JSON file per save event, `checkpoint_<step>.json`, written next to
//! the progress artifacts. The step number is recoverable by parsing the
//! filename, which is what recency is judged by; filesystem timestamps are
//! never consulted.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use candle_core::{DType, Tensor};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    model::AcousticModel,
    optimizer::{GradientScalerState, OptimizerState},
    scheduler::SchedulerState,
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_PREFIX: &str = "checkpoint_";
const CHECKPOINT_SUFFIX: &str = ".json";

/// Immutable snapshot of everything a resumed run needs. A tagged record
/// with named fields, so a missing or extra key fails at deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    pub version: u32,
    /// Fingerprint of the configuration that produced this snapshot; used to
    /// warn about configuration drift on resume.
    pub config_sha256: String,
    pub model: Vec<ParameterData>,
    pub optimizer: OptimizerState,
    pub scaler: GradientScalerState,
    pub scheduler: SchedulerState,
    pub step_counter: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterData {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Writes a snapshot named by `step`. The file becomes visible under its
/// canonical name only after the rename, so a crash mid-write never leaves a
/// half-written checkpoint where `most_recent` would find it.
pub fn save(
    snapshot: &TrainingSnapshot,
    directory: &Path,
    step: usize,
) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            directory.display()
        ))
    })?;

    let final_path = directory.join(format!("{CHECKPOINT_PREFIX}{step}{CHECKPOINT_SUFFIX}"));
    let tmp_path = directory.join(format!("{CHECKPOINT_PREFIX}{step}{CHECKPOINT_SUFFIX}.tmp"));

    let data = serde_json::to_vec(snapshot)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize snapshot: {err}")))?;
    let mut file = File::create(&tmp_path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", tmp_path.display()))
    })?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", tmp_path.display()))
    })?;
    file.sync_all().map_err(|err| {
        TrainingError::runtime(format!("failed to sync {}: {err}", tmp_path.display()))
    })?;
    drop(file);

    fs::rename(&tmp_path, &final_path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move checkpoint into place at {}: {err}",
            final_path.display()
        ))
    })?;

    Ok(final_path)
}

/// Deserializes a snapshot, failing with `CorruptCheckpoint` when the file
/// is unreadable, the schema does not match, or the version is unsupported.
pub fn load(path: &Path) -> Result<TrainingSnapshot, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::corrupt_checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let snapshot: TrainingSnapshot = serde_json::from_reader(file).map_err(|err| {
        TrainingError::corrupt_checkpoint(format!("failed to parse {}: {err}", path.display()))
    })?;
    if snapshot.version != CHECKPOINT_VERSION {
        return Err(TrainingError::corrupt_checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            snapshot.version, CHECKPOINT_VERSION
        )));
    }
    Ok(snapshot)
}

/// Path of the checkpoint with the largest embedded step number, or `None`
/// when the directory holds no valid checkpoint file.
pub fn most_recent(directory: &Path) -> Result<Option<PathBuf>, TrainingError> {
    let entries = checkpoint_files(directory)?;
    Ok(entries
        .into_iter()
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path))
}

/// Retains the `keep` checkpoints with the largest embedded step numbers and
/// deletes the rest. A no-op when at most `keep` exist; the checkpoint that
/// was just written carries the largest step, so it always survives.
pub fn prune(directory: &Path, keep: usize) -> Result<(), TrainingError> {
    if keep == 0 {
        return Ok(());
    }
    let mut entries = checkpoint_files(directory)?;
    if entries.len() <= keep {
        return Ok(());
    }
    entries.sort_by_key(|(step, _)| *step);
    let victims = entries.len() - keep;
    for (_, path) in entries.into_iter().take(victims) {
        fs::remove_file(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

/// Captures the model's named parameters as flat f32 records.
pub fn collect_model_parameters(
    model: &dyn AcousticModel,
) -> Result<Vec<ParameterData>, TrainingError> {
    let named = model.parameters();
    if named.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut parameters = Vec::with_capacity(named.len());
    for (name, var) in named {
        let tensor = var.as_tensor();
        let shape = tensor.dims().to_vec();
        let values = tensor
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .flatten_all()
            .map_err(to_runtime_error)?
            .to_vec1::<f32>()
            .map_err(to_runtime_error)?;
        parameters.push(ParameterData {
            name,
            shape,
            values,
        });
    }
    Ok(parameters)
}

/// Writes persisted parameter values back into the live model, matching by
/// name and validating shapes. Used both by full restore and fine-tuning.
pub fn apply_model_parameters(
    model: &dyn AcousticModel,
    parameters: &[ParameterData],
) -> Result<(), TrainingError> {
    let mut by_name: std::collections::HashMap<&str, &ParameterData> = parameters
        .iter()
        .map(|param| (param.name.as_str(), param))
        .collect();

    for (name, var) in model.parameters() {
        let record = by_name.remove(name.as_str()).ok_or_else(|| {
            TrainingError::corrupt_checkpoint(format!("checkpoint missing parameter '{name}'"))
        })?;
        let dims = var.as_tensor().dims().to_vec();
        if dims != record.shape || record.values.len() != dims.iter().product::<usize>() {
            return Err(TrainingError::corrupt_checkpoint(format!(
                "checkpoint shape mismatch for parameter '{name}'"
            )));
        }
        let device = var.as_tensor().device().clone();
        let tensor = Tensor::from_vec(record.values.clone(), record.values.len(), &device)
            .map_err(to_runtime_error)?
            .reshape(dims.as_slice())
            .map_err(to_runtime_error)?;
        let tensor = if tensor.dtype() == var.as_tensor().dtype() {
            tensor
        } else {
            tensor
                .to_dtype(var.as_tensor().dtype())
                .map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainingError::corrupt_checkpoint(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn checkpoint_files(directory: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut files = Vec::new();
    if !directory.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            directory.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(step) = parse_step(name) {
            files.push((step, entry.path()));
        }
    }
    Ok(files)
}

fn parse_step(filename: &str) -> Option<usize> {
    let rest = filename.strip_prefix(CHECKPOINT_PREFIX)?;
    let digits = rest.strip_suffix(CHECKPOINT_SUFFIX)?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot(step: usize) -> TrainingSnapshot {
        TrainingSnapshot {
            version: CHECKPOINT_VERSION,
            config_sha256: "deadbeef".to_string(),
            model: vec![ParameterData {
                name: "weight".to_string(),
                shape: vec![2],
                values: vec![1.0, -1.0],
            }],
            optimizer: OptimizerState {
                step,
                parameters: Vec::new(),
            },
            scaler: GradientScalerState {
                loss_scale: 1024.0,
                stable_steps: 3,
            },
            scheduler: SchedulerState { current_step: step },
            step_counter: step,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = save(&snapshot(42), dir.path(), 42).unwrap();
        assert!(path.ends_with("checkpoint_42.json"));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.step_counter, 42);
        assert_eq!(loaded.scheduler.current_step, 42);
        assert_eq!(loaded.scaler.loss_scale, 1024.0);
        assert_eq!(loaded.model[0].values, vec![1.0, -1.0]);
    }

    #[test]
    fn no_temporary_file_is_left_behind() {
        let dir = tempdir().unwrap();
        save(&snapshot(7), dir.path(), 7).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["checkpoint_7.json".to_string()]);
    }

    #[test]
    fn most_recent_picks_largest_step_independent_of_write_order() {
        let dir = tempdir().unwrap();
        assert!(most_recent(dir.path()).unwrap().is_none());

        // Written newest-step first on purpose.
        save(&snapshot(300), dir.path(), 300).unwrap();
        save(&snapshot(100), dir.path(), 100).unwrap();
        save(&snapshot(200), dir.path(), 200).unwrap();

        let latest = most_recent(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("checkpoint_300.json"));
    }

    #[test]
    fn most_recent_ignores_unrelated_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("checkpoint_.json"), b"{}").unwrap();
        assert!(most_recent(dir.path()).unwrap().is_none());
    }

    #[test]
    fn prune_keeps_the_largest_steps() {
        let dir = tempdir().unwrap();
        for step in [10, 20, 30, 40, 50, 60, 70] {
            save(&snapshot(step), dir.path(), step).unwrap();
        }

        prune(dir.path(), 5).unwrap();

        let mut remaining: Vec<usize> = checkpoint_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|(step, _)| step)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![30, 40, 50, 60, 70]);
    }

    #[test]
    fn prune_is_a_no_op_below_the_limit() {
        let dir = tempdir().unwrap();
        save(&snapshot(1), dir.path(), 1).unwrap();
        save(&snapshot(2), dir.path(), 2).unwrap();
        prune(dir.path(), 5).unwrap();
        assert_eq!(checkpoint_files(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn truncated_file_reports_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint_9.json");
        fs::write(&path, b"{\"version\":1,\"config_sha").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, TrainingError::CorruptCheckpoint(_)));
    }

    #[test]
    fn missing_field_reports_corruption() {
        let dir = tempdir().unwrap();
        let mut value = serde_json::to_value(snapshot(5)).unwrap();
        value.as_object_mut().unwrap().remove("scaler");
        let path = dir.path().join("checkpoint_5.json");
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, TrainingError::CorruptCheckpoint(_)));
    }
}
