//! The model the surrogate is trained to imitate.

use burn::prelude::*;
use serde_json::Value;
use vitshap_core::CoreError;
use vitshap_models::{Backbone, BackboneRegistry};

use crate::error::{Result, TrainError};

/// Output of a [`TargetModel`].
#[derive(Debug, Clone)]
pub struct TargetOutput<B: Backend> {
    /// Raw logits `(B, output_dim)`.
    pub logits: Tensor<B, 2>,
}

/// A frozen model queried for reference logits.
///
/// Implementations run on a backend without autodiff, so no gradients are
/// tracked through them. The trainer calls [`set_eval`](TargetModel::set_eval)
/// once and never mutates the model otherwise.
pub trait TargetModel<B: Backend> {
    /// Logits for an image batch.
    fn forward(&self, images: Tensor<B, 4>) -> Result<TargetOutput<B>>;

    /// Switch to inference mode.
    fn set_eval(&mut self);

    /// Device the model lives on.
    fn device(&self) -> B::Device;
}

/// A registry backbone with its native classifier kept, used as a target.
///
/// [`forward`](TargetModel::forward) refuses to run until
/// [`set_eval`](TargetModel::set_eval) has detached the parameters from
/// gradient tracking.
#[derive(Debug)]
pub struct FrozenClassifier<B: Backend> {
    backbone: Backbone<B>,
    device: B::Device,
    eval: bool,
}

impl<B: Backend> FrozenClassifier<B> {
    /// Wrap a backbone.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::TargetError`] if the backbone has no native classifier.
    pub fn new(backbone: Backbone<B>, device: B::Device) -> Result<Self> {
        if !backbone.has_native_head() {
            return Err(TrainError::TargetError(format!(
                "{} backbone has no '{}' classifier",
                backbone.kind(),
                backbone.kind().native_head_name()
            )));
        }
        Ok(Self {
            backbone,
            device,
            eval: false,
        })
    }

    /// Build `name` from `registry` with `overrides`.
    ///
    /// # Errors
    ///
    /// Returns a core error if the backbone cannot be built.
    pub fn from_registry(
        registry: &BackboneRegistry<B>,
        name: &str,
        overrides: &Value,
        device: &B::Device,
    ) -> Result<Self> {
        let backbone = registry.create(name, overrides, device)?;
        Self::new(backbone, device.clone())
    }

    /// Whether [`set_eval`](TargetModel::set_eval) was called.
    pub fn is_eval(&self) -> bool {
        self.eval
    }
}

impl<B: Backend> TargetModel<B> for FrozenClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Result<TargetOutput<B>> {
        if !self.eval {
            return Err(TrainError::TargetError(
                "target must be switched to inference mode before forward".to_string(),
            ));
        }
        let logits = self
            .backbone
            .classify(images)
            .map_err(|e: CoreError| TrainError::TargetError(e.to_string()))?;
        Ok(TargetOutput { logits })
    }

    fn set_eval(&mut self) {
        if !self.eval {
            self.backbone = self.backbone.clone().no_grad();
            self.eval = true;
        }
    }

    fn device(&self) -> B::Device {
        self.device.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use serde_json::json;
    use vitshap_models::default_registry;

    type TestBackend = NdArray;

    #[test]
    fn test_frozen_classifier() {
        let device = Default::default();
        let registry = default_registry::<TestBackend>();
        let overrides = json!({
            "img_size": 32,
            "patch_size": 8,
            "embed_dim": 16,
            "depth": 1,
            "num_heads": 2,
            "num_classes": 3
        });
        let mut target =
            FrozenClassifier::from_registry(&registry, "vit_tiny_patch16_224", &overrides, &device).unwrap();
        assert!(!target.is_eval());
        assert!(matches!(
            target.forward(Tensor::zeros([2, 3, 32, 32], &device)),
            Err(TrainError::TargetError(_))
        ));
        target.set_eval();
        assert!(target.is_eval());

        let out = target.forward(Tensor::zeros([2, 3, 32, 32], &device)).unwrap();
        assert_eq!(out.logits.dims(), [2, 3]);
    }

    #[test]
    fn test_headless_backbone_rejected() {
        let device = Default::default();
        let registry = default_registry::<TestBackend>();
        let backbone = registry
            .create("resnet18", &json!({ "layers": [1, 1, 1, 1], "base_width": 4 }), &device)
            .unwrap()
            .without_head();
        assert!(matches!(
            FrozenClassifier::new(backbone, device),
            Err(TrainError::TargetError(_))
        ));
    }
}
