//! The surrogate model: backbone adapter, mask strategy and head.
//!
//! Construction walks through a fixed sequence of stages:
//!
//! ```text
//! Uninitialized -> BackboneSelected -> HeadAttached -> (WeightsLoaded) -> Validated -> Ready
//! ```
//!
//! Pretrained weights are merged into the backbone before its native
//! classifier is stripped; checkpoint weights are merged into the finished
//! model (`backbone.*`, `head.*`). Both merges are non-strict and report the
//! keys they could not match.

use std::fmt;
use std::path::{Path, PathBuf};

use burn::module::Ignored;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vitshap_core::{BackboneKind, CoreError, MaskLocation, Result, TargetType};

use crate::backbone::Backbone;
use crate::checkpoint::{read_state_dict, save_state_dict, CheckpointFormat};
use crate::head::{Head, HeadConfig};
use crate::pretrained::WeightSource;
use crate::registry::{default_registry, BackboneRegistry};
use crate::state_dict::{self, join, LoadReport, NamedParameters, ParamMapper, StateDict};

/// Configuration for [`SurrogateModel`].
///
/// # Example
///
/// ```rust,ignore
/// let config = SurrogateConfig::new("vit_base_patch16_224", MaskLocation::PreSoftmax, TargetType::MultiClass, 10)
///     .with_load_path("checkpoints/best.mpk");
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateConfig {
    /// Where the mask is injected.
    pub mask_location: MaskLocation,
    /// Registry name of the backbone.
    pub backbone_type: String,
    /// Architecture overrides passed to the backbone constructor.
    #[serde(default)]
    pub backbone_overrides: Value,
    /// Initialize the backbone with pretrained weights.
    #[serde(default)]
    pub download_weight: bool,
    /// Checkpoint to hydrate the model from.
    #[serde(default)]
    pub load_path: Option<PathBuf>,
    /// Whether `load_path` holds a bare parameter map rather than a nested checkpoint.
    #[serde(default)]
    pub load_path_state_dict: bool,
    /// How the logits are interpreted.
    pub target_type: TargetType,
    /// Head output dimension.
    pub output_dim: usize,
    /// Pretrained weight source.
    #[serde(default)]
    pub weights: WeightSource,
}

impl SurrogateConfig {
    /// Create a config with randomly initialized weights.
    pub fn new(
        backbone_type: impl Into<String>,
        mask_location: MaskLocation,
        target_type: TargetType,
        output_dim: usize,
    ) -> Self {
        Self {
            mask_location,
            backbone_type: backbone_type.into(),
            backbone_overrides: Value::Null,
            download_weight: false,
            load_path: None,
            load_path_state_dict: false,
            target_type,
            output_dim,
            weights: WeightSource::default(),
        }
    }

    /// Load a config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] or [`CoreError::Serialization`] on failure.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Set the backbone architecture overrides.
    pub fn with_backbone_overrides(mut self, overrides: Value) -> Self {
        self.backbone_overrides = overrides;
        self
    }

    /// Enable or disable pretrained initialization.
    pub fn with_download_weight(mut self, download_weight: bool) -> Self {
        self.download_weight = download_weight;
        self
    }

    /// Set the checkpoint path.
    pub fn with_load_path(mut self, load_path: impl Into<PathBuf>) -> Self {
        self.load_path = Some(load_path.into());
        self
    }

    /// Set the checkpoint layout flag.
    pub fn with_load_path_state_dict(mut self, load_path_state_dict: bool) -> Self {
        self.load_path_state_dict = load_path_state_dict;
        self
    }

    /// Set the pretrained weight source.
    pub fn with_weights(mut self, weights: WeightSource) -> Self {
        self.weights = weights;
        self
    }

    /// Set the mask location.
    pub fn with_mask_location(mut self, mask_location: MaskLocation) -> Self {
        self.mask_location = mask_location;
        self
    }

    /// Check the options that do not depend on the backbone.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConflictingInitialization`] if both `download_weight` and `load_path` are set
    /// - [`CoreError::InvalidConfig`] if `output_dim` is zero
    pub fn validate(&self) -> Result<()> {
        if let (true, Some(path)) = (self.download_weight, &self.load_path) {
            return Err(CoreError::ConflictingInitialization {
                load_path: path.display().to_string(),
            });
        }
        if self.output_dim == 0 {
            return Err(CoreError::InvalidConfig("output_dim must be positive".to_string()));
        }
        Ok(())
    }
}

/// Immutable settings fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurrogateSettings {
    /// Registry name of the backbone.
    pub backbone_type: String,
    /// Backbone family.
    pub kind: BackboneKind,
    /// Default mask location.
    pub mask_location: MaskLocation,
    /// How the logits are interpreted.
    pub target_type: TargetType,
    /// Head output dimension.
    pub output_dim: usize,
    /// Number of players per image.
    pub num_players: usize,
    /// Backbone feature width.
    pub feature_width: usize,
}

/// Output of [`SurrogateModel::masked_forward`].
#[derive(Debug, Clone)]
pub struct SurrogateOutput<B: Backend> {
    /// Raw logits `(B, output_dim)`.
    pub logits: Tensor<B, 2>,
    /// Class-token or pooled embedding `(B, feature_width)`.
    pub embedding: Tensor<B, 2>,
    /// Per-player embeddings `(B, num_players, feature_width)`; transformers only.
    pub tokens: Option<Tensor<B, 3>>,
}

/// A built model with the reports of the weight merges that produced it.
#[derive(Debug)]
pub struct SurrogateBuild<B: Backend> {
    /// The ready model.
    pub model: SurrogateModel<B>,
    /// Result of merging pretrained weights, if requested.
    pub pretrained_report: Option<LoadReport>,
    /// Result of merging the checkpoint, if `load_path` was set.
    pub checkpoint_report: Option<LoadReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    BackboneSelected,
    HeadAttached,
    WeightsLoaded,
    Validated,
    Ready,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::BackboneSelected => "backbone-selected",
            Stage::HeadAttached => "head-attached",
            Stage::WeightsLoaded => "weights-loaded",
            Stage::Validated => "validated",
            Stage::Ready => "ready",
        };
        f.write_str(name)
    }
}

fn enter(stage: Stage, backbone_type: &str) {
    tracing::debug!("surrogate({}): {}", backbone_type, stage);
}

/// Surrogate model: a backbone with its native classifier stripped and a
/// linear head, evaluated under a player mask.
#[derive(Module, Debug)]
pub struct SurrogateModel<B: Backend> {
    backbone: Backbone<B>,
    head: Head<B>,
    settings: Ignored<SurrogateSettings>,
}

impl<B: Backend> SurrogateModel<B> {
    /// Build a model from the default registry.
    ///
    /// # Errors
    ///
    /// See [`SurrogateModel::build`].
    pub fn new(config: &SurrogateConfig, device: &B::Device) -> Result<Self> {
        Ok(Self::build(config, &default_registry(), device)?.model)
    }

    /// Build a model, returning the weight merge reports alongside it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConflictingInitialization`] if both `download_weight` and `load_path` are set
    /// - [`CoreError::UnsupportedBackbone`] if `backbone_type` is not registered
    /// - [`CoreError::PretrainedWeights`] / [`CoreError::Checkpoint`] if weights cannot be read
    /// - [`CoreError::InvalidMaskLocation`] if the backbone family does not support `mask_location`
    pub fn build(
        config: &SurrogateConfig,
        registry: &BackboneRegistry<B>,
        device: &B::Device,
    ) -> Result<SurrogateBuild<B>> {
        config.validate()?;
        let name = config.backbone_type.as_str();

        let kind = registry.kind_of(name)?;
        let mut backbone = registry.create(name, &config.backbone_overrides, device)?;
        enter(Stage::BackboneSelected, name);

        let pretrained_report = if config.download_weight {
            let state = config.weights.load::<B>(name, device)?;
            let (loaded, report) = state_dict::load_state_dict(backbone, "", &state);
            backbone = loaded;
            report.log(&format!("pretrained weights for {}", name));
            tracing::info!("The backbone parameters were initialized with the downloaded pretrained weights.");
            Some(report)
        } else {
            tracing::info!("The backbone parameters were randomly initialized.");
            None
        };

        let feature_width = backbone.feature_width();
        let num_players = backbone.num_players();
        let backbone = backbone.without_head();
        let head = HeadConfig::new(feature_width, config.output_dim).init(device);
        enter(Stage::HeadAttached, name);

        let settings = SurrogateSettings {
            backbone_type: name.to_string(),
            kind,
            mask_location: config.mask_location,
            target_type: config.target_type,
            output_dim: config.output_dim,
            num_players,
            feature_width,
        };
        let mut model = Self {
            backbone,
            head,
            settings: Ignored(settings),
        };

        let checkpoint_report = match &config.load_path {
            Some(path) => {
                let format = CheckpointFormat::from_flag(config.load_path_state_dict);
                let state = read_state_dict::<B>(path, format, device)?;
                let (loaded, report) = model.load_state_dict(&state);
                model = loaded;
                report.log(&format!("a checkpoint file {}", path.display()));
                enter(Stage::WeightsLoaded, name);
                Some(report)
            }
            None => None,
        };

        kind.check(config.mask_location)?;
        enter(Stage::Validated, name);

        tracing::info!(
            "Surrogate {} ready: {} players, feature width {}, mask location {}",
            name,
            num_players,
            feature_width,
            config.mask_location
        );
        enter(Stage::Ready, name);

        Ok(SurrogateBuild {
            model,
            pretrained_report,
            checkpoint_report,
        })
    }

    /// Masked forward.
    ///
    /// `location` overrides the configured mask location for this call and is
    /// validated against the backbone family.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ShapeMismatch`] if `masks` is not `(batch, num_players)`
    /// - [`CoreError::InvalidMaskLocation`] if the override is not supported
    pub fn masked_forward(
        &self,
        images: Tensor<B, 4>,
        masks: Tensor<B, 2>,
        location: Option<MaskLocation>,
    ) -> Result<SurrogateOutput<B>> {
        let settings = &self.settings.0;
        let [batch, players] = masks.dims();
        if players != settings.num_players {
            return Err(CoreError::ShapeMismatch(format!(
                "masks have {} players, surrogate expects {}",
                players, settings.num_players
            )));
        }
        if batch != images.dims()[0] {
            return Err(CoreError::ShapeMismatch(format!(
                "mask batch {} != image batch {}",
                batch,
                images.dims()[0]
            )));
        }
        let location = location.unwrap_or(settings.mask_location);
        settings.kind.check(location)?;

        let out = self.backbone.forward_masked(images, masks, location)?;
        Ok(SurrogateOutput {
            logits: self.head.forward(out.embedding.clone()),
            embedding: out.embedding,
            tokens: out.tokens,
        })
    }

    /// Forward without a mask.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if a transformer receives images of the wrong size.
    pub fn forward_unmasked(&self, images: Tensor<B, 4>) -> Result<SurrogateOutput<B>> {
        let out = self.backbone.forward_unmasked(images)?;
        Ok(SurrogateOutput {
            logits: self.head.forward(out.embedding.clone()),
            embedding: out.embedding,
            tokens: out.tokens,
        })
    }

    /// All parameters under `backbone.*` and `head.*`.
    pub fn state_dict(&self) -> StateDict {
        state_dict::state_dict(self, "")
    }

    /// Merge `state` non-strictly.
    pub fn load_state_dict(self, state: &StateDict) -> (Self, LoadReport) {
        state_dict::load_state_dict(self, "", state)
    }

    /// Write the parameters as a bare state dict and return the path written.
    ///
    /// # Errors
    ///
    /// Returns an I/O or serialization error if the file cannot be written.
    pub fn save_state_dict(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        save_state_dict::<B>(self.state_dict(), path)
    }

    /// Settings fixed at construction.
    pub fn settings(&self) -> &SurrogateSettings {
        &self.settings.0
    }

    /// Backbone family.
    pub fn kind(&self) -> BackboneKind {
        self.settings.0.kind
    }

    /// Number of players per image.
    pub fn num_players(&self) -> usize {
        self.settings.0.num_players
    }

    /// Default mask location.
    pub fn mask_location(&self) -> MaskLocation {
        self.settings.0.mask_location
    }

    /// How the logits are interpreted.
    pub fn target_type(&self) -> TargetType {
        self.settings.0.target_type
    }

    /// Head output dimension.
    pub fn output_dim(&self) -> usize {
        self.settings.0.output_dim
    }

    /// The headless backbone.
    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }
}

impl<B: Backend> NamedParameters<B> for SurrogateModel<B> {
    fn map_named<M: ParamMapper<B>>(mut self, prefix: &str, mapper: &mut M) -> Self {
        self.backbone = self.backbone.map_named(&join(prefix, "backbone"), mapper);
        self.head = self.head.map_named(&join(prefix, "head"), mapper);
        self
    }
}
