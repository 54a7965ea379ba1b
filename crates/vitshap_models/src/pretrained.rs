//! Pretrained backbone weights.
//!
//! Weights are bare state-dict checkpoints named `<backbone_type>.mpk`. They
//! are looked up in a cache directory and, when missing, fetched once from a
//! configured base URL.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use vitshap_core::{CoreError, Result};

use crate::checkpoint::{read_state_dict, CheckpointFormat, CHECKPOINT_EXTENSION};
use crate::state_dict::StateDict;

/// Cache directory for pretrained weights, relative to the home directory.
pub const WEIGHTS_CACHE_DIR: &str = ".vitshap/weights";

/// Where pretrained weights come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSource {
    /// Cache directory; defaults to `~/.vitshap/weights`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Base URL serving `<backbone_type>.mpk`.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl WeightSource {
    /// Use `cache_dir` instead of the default.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Download missing weights from `base_url`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Effective cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(WEIGHTS_CACHE_DIR)
        })
    }

    /// Cache path for `backbone_type`.
    pub fn path_for(&self, backbone_type: &str) -> PathBuf {
        self.cache_dir()
            .join(format!("{}.{}", backbone_type, CHECKPOINT_EXTENSION))
    }

    /// Locate the weights file, downloading it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PretrainedWeights`] if the file is not cached and
    /// cannot be downloaded.
    pub fn resolve(&self, backbone_type: &str) -> Result<PathBuf> {
        let path = self.path_for(backbone_type);
        if path.exists() {
            return Ok(path);
        }
        let base_url = self.base_url.as_deref().ok_or_else(|| {
            CoreError::PretrainedWeights(format!(
                "{} not found and no base_url configured",
                path.display()
            ))
        })?;

        let url = format!(
            "{}/{}.{}",
            base_url.trim_end_matches('/'),
            backbone_type,
            CHECKPOINT_EXTENSION
        );
        tracing::info!("Downloading pretrained weights for {} from {}", backbone_type, url);
        std::fs::create_dir_all(self.cache_dir())?;
        download_file(&url, &path)?;
        Ok(path)
    }

    /// Load the pretrained state dict for `backbone_type`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PretrainedWeights`] if the weights cannot be
    /// resolved or parsed.
    pub fn load<B: Backend>(&self, backbone_type: &str, device: &B::Device) -> Result<StateDict> {
        let path = self.resolve(backbone_type)?;
        read_state_dict::<B>(&path, CheckpointFormat::StateDict, device)
            .map_err(|e| CoreError::PretrainedWeights(e.to_string()))
    }
}

/// Download a file from URL to path.
fn download_file(url: &str, path: &Path) -> Result<()> {
    let response = ureq::get(url)
        .call()
        .map_err(|e| CoreError::PretrainedWeights(format!("Failed to download {}: {}", url, e)))?;

    if response.status() != 200 {
        return Err(CoreError::PretrainedWeights(format!(
            "HTTP {} for {}",
            response.status(),
            url
        )));
    }

    let mut buffer = Vec::new();
    std::io::Read::read_to_end(&mut response.into_reader(), &mut buffer)?;

    // Only complete downloads appear under the cached name.
    let partial = path.with_extension(format!("{}.part", CHECKPOINT_EXTENSION));
    let mut file = File::create(&partial)?;
    file.write_all(&buffer)?;
    file.flush()?;
    std::fs::rename(&partial, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::save_state_dict;
    use crate::state_dict::TensorRecord;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_cached_weights_load() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let source = WeightSource::default().with_cache_dir(dir.path());

        let mut state = StateDict::new();
        state.insert(
            "fc.bias",
            TensorRecord {
                shape: vec![1],
                data: vec![2.0],
            },
        );
        save_state_dict::<TestBackend>(state.clone(), source.path_for("resnet18")).unwrap();

        assert_eq!(source.load::<TestBackend>("resnet18", &device).unwrap(), state);
    }

    #[test]
    fn test_missing_weights_without_url() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let source = WeightSource::default().with_cache_dir(dir.path());
        assert!(matches!(
            source.load::<TestBackend>("resnet50", &device),
            Err(CoreError::PretrainedWeights(_))
        ));
    }

    #[test]
    fn test_default_cache_dir() {
        let source = WeightSource::default();
        assert!(source.cache_dir().ends_with(WEIGHTS_CACHE_DIR));
        assert!(source
            .path_for("vit_base_patch16_224")
            .ends_with("weights/vit_base_patch16_224.mpk"));
    }
}
