//! Checkpoint files.
//!
//! Checkpoints are written with burn's [`NamedMpkFileRecorder`] at full
//! precision, so every file carries the `.mpk` extension whatever extension
//! the caller passes. Two layouts are read:
//!
//! - **State dict**: a bare record mapping parameter names to tensors.
//! - **Nested**: a [`TrainingCheckpoint`] whose `state_dict` field holds that
//!   map, as written by [`save_training_checkpoint`].
//!
//! # Example
//!
//! ```rust,ignore
//! use vitshap_models::checkpoint::{read_state_dict, save_state_dict, CheckpointFormat};
//!
//! let path = save_state_dict::<B>(model.state_dict(), "surrogate.mpk")?;
//! let state = read_state_dict::<B>(&path, CheckpointFormat::StateDict, &device)?;
//! ```

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, PrecisionSettings, Record, Recorder};
use serde::{Deserialize, Serialize};
use vitshap_core::{CoreError, Result};

use crate::state_dict::StateDict;

/// Extension of checkpoint files.
pub const CHECKPOINT_EXTENSION: &str = "mpk";

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Layout of a checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Bare parameter map.
    StateDict,
    /// Training checkpoint with a `state_dict` field.
    Nested,
}

impl CheckpointFormat {
    /// Pick the layout from the `load_path_state_dict` flag.
    pub fn from_flag(load_path_state_dict: bool) -> Self {
        if load_path_state_dict {
            CheckpointFormat::StateDict
        } else {
            CheckpointFormat::Nested
        }
    }
}

/// A named scalar used to rank checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetric {
    /// Metric name, e.g. `val/loss`.
    pub name: String,
    /// Metric value.
    pub value: f64,
}

/// Checkpoint written during training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    /// Model parameters.
    pub state_dict: StateDict,
    /// Epoch the checkpoint was taken at.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: usize,
    /// Metric the checkpoint was selected by.
    #[serde(default)]
    pub metric: Option<CheckpointMetric>,
}

// Parameter maps are stored as plain f32 values whatever the precision
// settings, so the item is the record itself.
impl<B: Backend> Record<B> for StateDict {
    type Item<S: PrecisionSettings> = StateDict;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        self
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, _device: &B::Device) -> Self {
        item
    }
}

impl<B: Backend> Record<B> for TrainingCheckpoint {
    type Item<S: PrecisionSettings> = TrainingCheckpoint;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        self
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, _device: &B::Device) -> Self {
        item
    }
}

/// Path the recorder actually uses for `path`.
pub fn checkpoint_path(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref().with_extension(CHECKPOINT_EXTENSION)
}

fn checkpoint_error(path: &Path, e: impl std::fmt::Display) -> CoreError {
    CoreError::Checkpoint(format!("{}: {}", path.display(), e))
}

/// Read the parameter map from a checkpoint file.
///
/// # Errors
///
/// Returns [`CoreError::Checkpoint`] if the file cannot be opened or decoded,
/// a nested checkpoint has no `state_dict` field, or a tensor's data does not
/// fill its shape.
pub fn read_state_dict<B: Backend>(
    path: impl AsRef<Path>,
    format: CheckpointFormat,
    device: &B::Device,
) -> Result<StateDict> {
    let path = checkpoint_path(path);
    let recorder = CheckpointRecorder::new();

    let state = match format {
        CheckpointFormat::StateDict => Recorder::<B>::load::<StateDict>(&recorder, path.clone(), device)
            .map_err(|e| checkpoint_error(&path, e))?,
        CheckpointFormat::Nested => {
            Recorder::<B>::load::<TrainingCheckpoint>(&recorder, path.clone(), device)
                .map_err(|e| checkpoint_error(&path, e))?
                .state_dict
        }
    };

    let inconsistent = state.inconsistent_keys();
    if !inconsistent.is_empty() {
        return Err(checkpoint_error(
            &path,
            format!("tensor data does not match shape for {:?}", inconsistent),
        ));
    }
    Ok(state)
}

fn write_record<B: Backend, R: Record<B>>(record: R, path: &Path) -> Result<PathBuf> {
    let path = checkpoint_path(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Recorder::<B>::record(&CheckpointRecorder::new(), record, path.clone())
        .map_err(|e| CoreError::Serialization(format!("{}: {}", path.display(), e)))?;
    Ok(path)
}

/// Write a bare parameter map and return the path written.
///
/// # Errors
///
/// Returns an I/O or serialization error if the file cannot be written.
pub fn save_state_dict<B: Backend>(state: StateDict, path: impl AsRef<Path>) -> Result<PathBuf> {
    write_record::<B, _>(state, path.as_ref())
}

/// Write a nested training checkpoint and return the path written.
///
/// # Errors
///
/// Returns an I/O or serialization error if the file cannot be written.
pub fn save_training_checkpoint<B: Backend>(
    checkpoint: TrainingCheckpoint,
    path: impl AsRef<Path>,
) -> Result<PathBuf> {
    write_record::<B, _>(checkpoint, path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_dict::TensorRecord;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn sample() -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "head.weight",
            TensorRecord {
                shape: vec![2, 1],
                data: vec![0.5, -0.5],
            },
        );
        state
    }

    #[test]
    fn test_from_flag() {
        assert_eq!(CheckpointFormat::from_flag(true), CheckpointFormat::StateDict);
        assert_eq!(CheckpointFormat::from_flag(false), CheckpointFormat::Nested);
    }

    #[test]
    fn test_extension_is_replaced() {
        assert_eq!(checkpoint_path("runs/best.json"), PathBuf::from("runs/best.mpk"));
        assert_eq!(checkpoint_path("runs/best"), PathBuf::from("runs/best.mpk"));
    }

    #[test]
    fn test_nested_checkpoint() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = TrainingCheckpoint {
            state_dict: sample(),
            epoch: 3,
            global_step: 120,
            metric: Some(CheckpointMetric {
                name: "val/loss".to_string(),
                value: 0.25,
            }),
        };
        let path = save_training_checkpoint::<TestBackend>(checkpoint, dir.path().join("ckpt").join("best.mpk"))
            .unwrap();
        assert!(path.exists());

        let state = read_state_dict::<TestBackend>(&path, CheckpointFormat::Nested, &device).unwrap();
        assert_eq!(state, sample());
    }

    #[test]
    fn test_bare_state_dict_is_not_nested() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = save_state_dict::<TestBackend>(sample(), dir.path().join("weights.mpk")).unwrap();

        assert_eq!(
            read_state_dict::<TestBackend>(&path, CheckpointFormat::StateDict, &device).unwrap(),
            sample()
        );
        assert!(matches!(
            read_state_dict::<TestBackend>(&path, CheckpointFormat::Nested, &device),
            Err(CoreError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let mut state = sample();
        state.insert(
            "head.bias",
            TensorRecord {
                shape: vec![4],
                data: vec![0.0],
            },
        );
        let path = save_state_dict::<TestBackend>(state, dir.path().join("truncated.mpk")).unwrap();

        match read_state_dict::<TestBackend>(&path, CheckpointFormat::StateDict, &device) {
            Err(CoreError::Checkpoint(msg)) => assert!(msg.contains("head.bias")),
            other => panic!("Expected Checkpoint error, got {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_file() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.mpk");
        std::fs::write(&path, b"not a checkpoint").unwrap();
        assert!(matches!(
            read_state_dict::<TestBackend>(&path, CheckpointFormat::StateDict, &device),
            Err(CoreError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.mpk");
        assert!(matches!(
            read_state_dict::<TestBackend>(&path, CheckpointFormat::StateDict, &device),
            Err(CoreError::Checkpoint(_))
        ));
    }
}
