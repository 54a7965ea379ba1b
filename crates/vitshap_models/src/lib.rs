//! # vitshap_models
//!
//! Backbones, masking and the surrogate model for vitshap.
//!
//! ## Backbones
//! - [`VisionTransformer`] - ViT with mask injection at every supported location
//! - [`ResNet`] - torchvision-style ResNet (basic and bottleneck blocks)
//! - [`DenseNet`] - torchvision-style DenseNet
//!
//! All three are wrapped by the [`Backbone`] adapter, built by name through the
//! [`BackboneRegistry`], and exchange weights as named [`StateDict`]s.
//!
//! ## Surrogate
//! - [`SurrogateModel`] - backbone + [`Head`], masked forward, checkpoint hydration
//!
//! ```rust,ignore
//! use vitshap_models::{SurrogateConfig, SurrogateModel};
//! use vitshap_core::{MaskLocation, TargetType};
//!
//! let config = SurrogateConfig::new("vit_small_patch16_224", MaskLocation::PreSoftmax, TargetType::MultiClass, 10);
//! let model = SurrogateModel::<NdArray>::new(&config, &device)?;
//! let output = model.masked_forward(images, masks, None)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backbone;
pub mod checkpoint;
pub mod densenet;
pub mod head;
pub mod masking;
pub mod pretrained;
pub mod registry;
pub mod resnet;
pub mod state_dict;
pub mod surrogate;
pub mod vit;

pub use backbone::{Backbone, BackboneOutput};
pub use checkpoint::{
    checkpoint_path, read_state_dict, save_state_dict, save_training_checkpoint,
    CheckpointFormat, CheckpointMetric, TrainingCheckpoint, CHECKPOINT_EXTENSION,
};
pub use densenet::{DenseNet, DenseNetConfig};
pub use head::{Head, HeadConfig};
pub use pretrained::WeightSource;
pub use registry::{default_registry, BackboneConstructor, BackboneRegistry};
pub use resnet::{ResNet, ResNetConfig};
pub use state_dict::{LoadReport, NamedParameters, ParamMapper, StateDict, TensorRecord};
pub use surrogate::{
    SurrogateBuild, SurrogateConfig, SurrogateModel, SurrogateOutput, SurrogateSettings,
};
pub use vit::{VisionTransformer, VisionTransformerConfig, ViTOutput};
