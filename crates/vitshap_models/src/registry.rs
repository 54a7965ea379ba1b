//! Backbone registry for building backbones by name.
//!
//! Each entry records the backbone family and a constructor taking JSON
//! architecture overrides. Unknown names fail with
//! [`CoreError::UnsupportedBackbone`].
//!
//! # Example
//!
//! ```rust,ignore
//! use vitshap_models::registry::default_registry;
//! use serde_json::json;
//!
//! let registry = default_registry::<NdArray>();
//! let overrides = json!({ "img_size": 32, "patch_size": 8, "depth": 2 });
//! let backbone = registry.create("vit_small_patch16_224", &overrides, &device)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use burn::prelude::*;
use serde_json::Value;
use vitshap_core::{BackboneKind, CoreError, Result};

use crate::backbone::Backbone;
use crate::densenet::DenseNetConfig;
use crate::resnet::ResNetConfig;
use crate::vit::VisionTransformerConfig;

/// Type alias for backbone constructors.
pub type BackboneConstructor<B> =
    Arc<dyn Fn(&Value, &<B as Backend>::Device) -> Result<Backbone<B>> + Send + Sync>;

struct Entry<B: Backend> {
    kind: BackboneKind,
    constructor: BackboneConstructor<B>,
}

/// Registry mapping backbone names to constructors.
pub struct BackboneRegistry<B: Backend> {
    entries: BTreeMap<String, Entry<B>>,
}

impl<B: Backend> Default for BackboneRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> BackboneRegistry<B> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a backbone constructor under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, kind: BackboneKind, constructor: F)
    where
        F: Fn(&Value, &<B as Backend>::Device) -> Result<Backbone<B>> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Entry {
                kind,
                constructor: Arc::new(constructor),
            },
        );
    }

    /// Build the backbone registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedBackbone`] for unknown names, or
    /// [`CoreError::InvalidConfig`] for bad overrides.
    pub fn create(&self, name: &str, overrides: &Value, device: &B::Device) -> Result<Backbone<B>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| CoreError::UnsupportedBackbone(name.to_string()))?;
        (entry.constructor)(overrides, device)
    }

    /// Family of the backbone registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnsupportedBackbone`] for unknown names.
    pub fn kind_of(&self, name: &str) -> Result<BackboneKind> {
        self.entries
            .get(name)
            .map(|e| e.kind)
            .ok_or_else(|| CoreError::UnsupportedBackbone(name.to_string()))
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a backbone is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

// ============================================================================
// Helper functions for parsing overrides
// ============================================================================

fn check_keys(overrides: &Value, allowed: &[&str]) -> Result<()> {
    match overrides {
        Value::Null => Ok(()),
        Value::Object(map) => match map.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(key) => Err(CoreError::InvalidConfig(format!(
                "unknown backbone override '{}' (allowed: {})",
                key,
                allowed.join(", ")
            ))),
            None => Ok(()),
        },
        other => Err(CoreError::InvalidConfig(format!(
            "backbone overrides must be a JSON object, got {}",
            other
        ))),
    }
}

fn invalid(key: &str, expected: &str) -> CoreError {
    CoreError::InvalidConfig(format!("override '{}' must be {}", key, expected))
}

fn get_usize_or(overrides: &Value, key: &str, default: usize) -> Result<usize> {
    match overrides.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| invalid(key, "a non-negative integer")),
    }
}

fn get_f64_or(overrides: &Value, key: &str, default: f64) -> Result<f64> {
    match overrides.get(key) {
        None => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| invalid(key, "a number")),
    }
}

fn get_bool_or(overrides: &Value, key: &str, default: bool) -> Result<bool> {
    match overrides.get(key) {
        None => Ok(default),
        Some(v) => v.as_bool().ok_or_else(|| invalid(key, "a boolean")),
    }
}

fn get_stages_or(overrides: &Value, key: &str, default: [usize; 4]) -> Result<[usize; 4]> {
    let Some(v) = overrides.get(key) else {
        return Ok(default);
    };
    let values: Vec<usize> = v
        .as_array()
        .ok_or_else(|| invalid(key, "an array of 4 integers"))?
        .iter()
        .map(|x| x.as_u64().map(|x| x as usize))
        .collect::<Option<_>>()
        .ok_or_else(|| invalid(key, "an array of 4 integers"))?;
    values
        .try_into()
        .map_err(|_| invalid(key, "an array of 4 integers"))
}

const VIT_KEYS: &[&str] = &[
    "img_size",
    "patch_size",
    "in_chans",
    "num_classes",
    "embed_dim",
    "depth",
    "num_heads",
    "mlp_ratio",
    "qkv_bias",
    "drop_rate",
];

const RESNET_KEYS: &[&str] = &["layers", "base_width", "in_chans", "num_classes"];

const DENSENET_KEYS: &[&str] = &[
    "growth_rate",
    "block_config",
    "num_init_features",
    "bn_size",
    "in_chans",
    "num_classes",
    "drop_rate",
];

/// Apply JSON overrides to a transformer preset.
pub fn vit_config(preset: VisionTransformerConfig, overrides: &Value) -> Result<VisionTransformerConfig> {
    check_keys(overrides, VIT_KEYS)?;
    Ok(VisionTransformerConfig {
        img_size: get_usize_or(overrides, "img_size", preset.img_size)?,
        patch_size: get_usize_or(overrides, "patch_size", preset.patch_size)?,
        in_chans: get_usize_or(overrides, "in_chans", preset.in_chans)?,
        num_classes: get_usize_or(overrides, "num_classes", preset.num_classes)?,
        embed_dim: get_usize_or(overrides, "embed_dim", preset.embed_dim)?,
        depth: get_usize_or(overrides, "depth", preset.depth)?,
        num_heads: get_usize_or(overrides, "num_heads", preset.num_heads)?,
        mlp_ratio: get_f64_or(overrides, "mlp_ratio", preset.mlp_ratio)?,
        qkv_bias: get_bool_or(overrides, "qkv_bias", preset.qkv_bias)?,
        drop_rate: get_f64_or(overrides, "drop_rate", preset.drop_rate)?,
        layer_norm_eps: preset.layer_norm_eps,
    })
}

/// Apply JSON overrides to a ResNet preset.
pub fn resnet_config(preset: ResNetConfig, overrides: &Value) -> Result<ResNetConfig> {
    check_keys(overrides, RESNET_KEYS)?;
    Ok(ResNetConfig {
        layers: get_stages_or(overrides, "layers", preset.layers)?,
        bottleneck: preset.bottleneck,
        base_width: get_usize_or(overrides, "base_width", preset.base_width)?,
        in_chans: get_usize_or(overrides, "in_chans", preset.in_chans)?,
        num_classes: get_usize_or(overrides, "num_classes", preset.num_classes)?,
    })
}

/// Apply JSON overrides to a DenseNet preset.
pub fn densenet_config(preset: DenseNetConfig, overrides: &Value) -> Result<DenseNetConfig> {
    check_keys(overrides, DENSENET_KEYS)?;
    Ok(DenseNetConfig {
        growth_rate: get_usize_or(overrides, "growth_rate", preset.growth_rate)?,
        block_config: get_stages_or(overrides, "block_config", preset.block_config)?,
        num_init_features: get_usize_or(overrides, "num_init_features", preset.num_init_features)?,
        bn_size: get_usize_or(overrides, "bn_size", preset.bn_size)?,
        in_chans: get_usize_or(overrides, "in_chans", preset.in_chans)?,
        num_classes: get_usize_or(overrides, "num_classes", preset.num_classes)?,
        drop_rate: get_f64_or(overrides, "drop_rate", preset.drop_rate)?,
    })
}

// ============================================================================
// Default registry with all backbones
// ============================================================================

/// Create a registry with all available backbones pre-registered.
///
/// # Available Backbones
///
/// - Transformers: `vit_tiny_patch16_224`, `vit_small_patch16_224`,
///   `vit_base_patch16_224`, `vit_large_patch16_224`, `vit_base_patch32_224`
/// - ResNet: `resnet18`, `resnet34`, `resnet50`, `resnet101`, `resnet152`
/// - DenseNet: `densenet121`, `densenet161`, `densenet169`, `densenet201`
pub fn default_registry<B: Backend>() -> BackboneRegistry<B> {
    let mut registry = BackboneRegistry::new();

    let transformers: [(&str, fn() -> VisionTransformerConfig); 5] = [
        ("vit_tiny_patch16_224", VisionTransformerConfig::vit_tiny_patch16_224),
        ("vit_small_patch16_224", VisionTransformerConfig::vit_small_patch16_224),
        ("vit_base_patch16_224", VisionTransformerConfig::vit_base_patch16_224),
        ("vit_large_patch16_224", VisionTransformerConfig::vit_large_patch16_224),
        ("vit_base_patch32_224", VisionTransformerConfig::vit_base_patch32_224),
    ];
    for (name, preset) in transformers {
        registry.register(name, BackboneKind::Transformer, move |overrides, device| {
            Ok(vit_config(preset(), overrides)?.init::<B>(device)?.into())
        });
    }

    let resnets: [(&str, fn() -> ResNetConfig); 5] = [
        ("resnet18", ResNetConfig::resnet18),
        ("resnet34", ResNetConfig::resnet34),
        ("resnet50", ResNetConfig::resnet50),
        ("resnet101", ResNetConfig::resnet101),
        ("resnet152", ResNetConfig::resnet152),
    ];
    for (name, preset) in resnets {
        registry.register(name, BackboneKind::ResNet, move |overrides, device| {
            Ok(resnet_config(preset(), overrides)?.init::<B>(device)?.into())
        });
    }

    let densenets: [(&str, fn() -> DenseNetConfig); 4] = [
        ("densenet121", DenseNetConfig::densenet121),
        ("densenet161", DenseNetConfig::densenet161),
        ("densenet169", DenseNetConfig::densenet169),
        ("densenet201", DenseNetConfig::densenet201),
    ];
    for (name, preset) in densenets {
        registry.register(name, BackboneKind::DenseNet, move |overrides, device| {
            Ok(densenet_config(preset(), overrides)?.init::<B>(device)?.into())
        });
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use serde_json::json;

    type TestBackend = NdArray;

    #[test]
    fn test_registry_new() {
        let registry: BackboneRegistry<TestBackend> = BackboneRegistry::new();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_default_registry_contains_all_backbones() {
        let registry: BackboneRegistry<TestBackend> = default_registry();
        assert_eq!(registry.list().len(), 14);
        assert_eq!(registry.kind_of("vit_base_patch32_224").unwrap(), BackboneKind::Transformer);
        assert_eq!(registry.kind_of("resnet101").unwrap(), BackboneKind::ResNet);
        assert_eq!(registry.kind_of("densenet169").unwrap(), BackboneKind::DenseNet);
    }

    #[test]
    fn test_unknown_backbone() {
        let registry: BackboneRegistry<TestBackend> = default_registry();
        let device = Default::default();
        match registry.create("vgg16", &Value::Null, &device) {
            Err(CoreError::UnsupportedBackbone(name)) => assert_eq!(name, "vgg16"),
            other => panic!("Expected UnsupportedBackbone, got {:?}", other.map(|b| b.kind())),
        }
        assert!(registry.kind_of("vgg16").is_err());
    }

    #[test]
    fn test_create_with_overrides() {
        let registry: BackboneRegistry<TestBackend> = default_registry();
        let device = Default::default();
        let overrides = json!({
            "img_size": 32,
            "patch_size": 8,
            "embed_dim": 16,
            "depth": 1,
            "num_heads": 2
        });
        let backbone = registry
            .create("vit_small_patch16_224", &overrides, &device)
            .unwrap();
        assert_eq!(backbone.num_players(), 16);
        assert_eq!(backbone.feature_width(), 16);
    }

    #[test]
    fn test_override_validation() {
        let preset = ResNetConfig::resnet18();
        assert!(resnet_config(preset.clone(), &json!({ "layers": [1, 1, 1] })).is_err());
        assert!(resnet_config(preset.clone(), &json!({ "base_width": "wide" })).is_err());
        assert!(resnet_config(preset.clone(), &json!({ "depth": 3 })).is_err());
        assert!(resnet_config(preset.clone(), &json!([1, 2])).is_err());

        let config = resnet_config(preset, &json!({ "layers": [1, 1, 1, 1], "base_width": 8 })).unwrap();
        assert_eq!(config.layers, [1, 1, 1, 1]);
        assert_eq!(config.feature_width(), 64);

        let config = densenet_config(DenseNetConfig::densenet121(), &json!({ "growth_rate": 4 })).unwrap();
        assert_eq!(config.growth_rate, 4);
        assert_eq!(config.block_config, [6, 12, 24, 16]);
    }
}
