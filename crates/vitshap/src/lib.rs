//! # vitshap
//!
//! Masking-aware surrogate models for Shapley value attribution of image
//! classifiers.
//!
//! An image is split into a grid of patches ("players"). A surrogate model
//! takes the image together with a `(batch, num_players)` mask and predicts
//! what a target classifier would output if only the kept players were
//! visible. The mask can be injected at five locations:
//!
//! - `zero-input`: masked pixels are set to zero (all backbones)
//! - `zero-embedding`: masked patch tokens are zeroed after embedding
//! - `pre-softmax`: masked keys get a large negative attention bias
//! - `post-softmax`: attention weights of masked keys are multiplied by zero
//! - `random-sampling`: players are kept at random with the mask value as probability
//!
//! The last four only exist for vision transformers.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vitshap::prelude::*;
//!
//! let config = SurrogateConfig::new("vit_small_patch16_224", MaskLocation::PreSoftmax, TargetType::MultiClass, 10);
//! let surrogate = SurrogateModel::<NdArray>::new(&config, &device)?;
//!
//! let masks = PlayerMask::ones(images.dims()[0], surrogate.num_players(), &device).without_player(17);
//! let output = surrogate.masked_forward(images, masks.into_inner(), None)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend using ndarray
//! - `backend-wgpu`: GPU backend using WGPU

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub use vitshap_core as core;
pub use vitshap_models as models;
pub use vitshap_train as train;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use vitshap::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use vitshap_core::{
        BackboneKind, CoreError, ImageShape, MaskLocation, PatchGrid, PlayerMask, Result,
        TargetType,
    };

    // Models
    pub use vitshap_models::{
        default_registry, Backbone, BackboneRegistry, SurrogateConfig, SurrogateModel,
        SurrogateOutput, WeightSource,
    };

    // Training
    pub use vitshap_train::{
        FrozenClassifier, ScheduleConfig, SurrogateBatch, SurrogateMetrics, SurrogateTrainer,
        TargetModel, TrainerConfig,
    };
}

/// All module for importing everything.
pub mod all {
    pub use super::prelude::*;

    pub use vitshap_core::backend;
    pub use vitshap_models::{
        read_state_dict, save_state_dict, save_training_checkpoint, CheckpointFormat, DenseNet, DenseNetConfig, Head,
        HeadConfig, LoadReport, ResNet, ResNetConfig, StateDict, SurrogateBuild,
        SurrogateSettings, TrainingCheckpoint, VisionTransformer, VisionTransformerConfig,
    };
    pub use vitshap_train::{
        set_schedule, CheckpointMetricKind, EpochSummary, FitOutput, OptimType, Phase, Scheduler,
        TrainError, WarmupCosineLR,
    };
}
