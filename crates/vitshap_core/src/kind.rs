//! Backbone families and mask injection points.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Where a player mask is injected into the backbone computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskLocation {
    /// Additive bias on attention logits before softmax.
    PreSoftmax,
    /// Multiplicative rescaling of attention weights after softmax.
    PostSoftmax,
    /// Pixels of masked players are zeroed before the backbone runs.
    ZeroInput,
    /// Patch embeddings of masked players are zeroed before the encoder.
    ZeroEmbedding,
    /// Players are retained with probability equal to their mask value.
    RandomSampling,
}

impl MaskLocation {
    /// All mask locations, in declaration order.
    pub const ALL: [MaskLocation; 5] = [
        MaskLocation::PreSoftmax,
        MaskLocation::PostSoftmax,
        MaskLocation::ZeroInput,
        MaskLocation::ZeroEmbedding,
        MaskLocation::RandomSampling,
    ];

    /// The configuration string for this location.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MaskLocation::PreSoftmax => "pre-softmax",
            MaskLocation::PostSoftmax => "post-softmax",
            MaskLocation::ZeroInput => "zero-input",
            MaskLocation::ZeroEmbedding => "zero-embedding",
            MaskLocation::RandomSampling => "random-sampling",
        }
    }

    /// Whether the forward pass is stochastic for a fixed mask.
    pub const fn is_stochastic(&self) -> bool {
        matches!(self, MaskLocation::RandomSampling)
    }

    /// Whether the mask acts on attention keys inside the encoder.
    pub const fn masks_attention(&self) -> bool {
        matches!(
            self,
            MaskLocation::PreSoftmax | MaskLocation::PostSoftmax | MaskLocation::RandomSampling
        )
    }
}

impl fmt::Display for MaskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaskLocation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        MaskLocation::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!(
                    "unknown mask location '{}', expected one of pre-softmax, post-softmax, \
                     zero-input, zero-embedding, random-sampling",
                    s
                ))
            })
    }
}

/// Backbone architecture family.
///
/// Decided once when the backbone is built; determines the legal mask
/// locations and which classifier the adapter strips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackboneKind {
    /// Vision Transformer with a patch embedding and class token.
    Transformer,
    /// ResNet family (classifier named `fc`).
    ResNet,
    /// DenseNet family (classifier named `classifier`).
    DenseNet,
}

const TRANSFORMER_LOCATIONS: &[MaskLocation] = &MaskLocation::ALL;
const CONVNET_LOCATIONS: &[MaskLocation] = &[MaskLocation::ZeroInput];

impl BackboneKind {
    /// Mask locations this family can honor.
    pub const fn supported_locations(&self) -> &'static [MaskLocation] {
        match self {
            BackboneKind::Transformer => TRANSFORMER_LOCATIONS,
            BackboneKind::ResNet | BackboneKind::DenseNet => CONVNET_LOCATIONS,
        }
    }

    /// Whether `location` is legal for this family.
    pub fn supports(&self, location: MaskLocation) -> bool {
        self.supported_locations().contains(&location)
    }

    /// Fail with [`CoreError::InvalidMaskLocation`] unless `location` is legal.
    pub fn check(&self, location: MaskLocation) -> Result<()> {
        if self.supports(location) {
            Ok(())
        } else {
            Err(CoreError::invalid_mask_location(location, *self))
        }
    }

    /// Whether this family is convolutional.
    pub const fn is_convnet(&self) -> bool {
        matches!(self, BackboneKind::ResNet | BackboneKind::DenseNet)
    }

    /// Name of the native classifier the adapter replaces.
    pub const fn native_head_name(&self) -> &'static str {
        match self {
            BackboneKind::Transformer => "head",
            BackboneKind::ResNet => "fc",
            BackboneKind::DenseNet => "classifier",
        }
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackboneKind::Transformer => "Transformer",
            BackboneKind::ResNet => "ResNet",
            BackboneKind::DenseNet => "DenseNet",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transformer_supports_everything() {
        for location in MaskLocation::ALL {
            assert!(BackboneKind::Transformer.supports(location));
        }
    }

    #[test]
    fn test_convnets_only_support_zero_input() {
        for kind in [BackboneKind::ResNet, BackboneKind::DenseNet] {
            for location in MaskLocation::ALL {
                let expected = location == MaskLocation::ZeroInput;
                assert_eq!(kind.supports(location), expected, "{} / {}", kind, location);
                assert_eq!(kind.check(location).is_ok(), expected);
            }
        }
    }

    #[test]
    fn test_check_error_variant() {
        match BackboneKind::DenseNet.check(MaskLocation::ZeroEmbedding) {
            Err(CoreError::InvalidMaskLocation { location, kind, .. }) => {
                assert_eq!(location, MaskLocation::ZeroEmbedding);
                assert_eq!(kind, BackboneKind::DenseNet);
            }
            other => panic!("Expected InvalidMaskLocation, got {:?}", other),
        }
    }

    #[test]
    fn test_mask_location_parse() {
        for location in MaskLocation::ALL {
            assert_eq!(location.as_str().parse::<MaskLocation>().unwrap(), location);
        }
        assert!("zero-out".parse::<MaskLocation>().is_err());
    }

    #[test]
    fn test_mask_location_serde_kebab_case() {
        let json = serde_json::to_string(&MaskLocation::PostSoftmax).unwrap();
        assert_eq!(json, "\"post-softmax\"");
        let parsed: MaskLocation = serde_json::from_str("\"random-sampling\"").unwrap();
        assert_eq!(parsed, MaskLocation::RandomSampling);
    }

    #[test]
    fn test_only_random_sampling_is_stochastic() {
        let stochastic: Vec<_> = MaskLocation::ALL
            .into_iter()
            .filter(|l| l.is_stochastic())
            .collect();
        assert_eq!(stochastic, vec![MaskLocation::RandomSampling]);
    }
}
