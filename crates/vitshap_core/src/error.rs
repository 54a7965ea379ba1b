//! Error types for vitshap.

use thiserror::Error;

use crate::kind::{BackboneKind, MaskLocation};

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building or running a surrogate model.
///
/// The first four variants are fatal contract violations; none of them is
/// retried anywhere in the workspace.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The backbone name is not known to the registry.
    #[error("Unsupported backbone type: '{0}'")]
    UnsupportedBackbone(String),

    /// Pretrained download and checkpoint loading were both requested.
    #[error(
        "'download_weight' and 'load_path' ({load_path}) cannot both be set: \
         the checkpoint would overwrite the downloaded weights"
    )]
    ConflictingInitialization {
        /// The checkpoint path that was requested.
        load_path: String,
    },

    /// The mask location is not legal for the backbone family.
    #[error("Mask location '{location}' is not supported by {kind} backbones (supported: {supported})")]
    InvalidMaskLocation {
        /// Requested mask location.
        location: MaskLocation,
        /// Backbone family.
        kind: BackboneKind,
        /// Comma separated list of legal locations.
        supported: String,
    },

    /// Mask or image dimensions do not match the backbone's expectations.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading or writing a checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Pretrained weights could not be resolved.
    #[error("Pretrained weights unavailable: {0}")]
    PretrainedWeights(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Build an [`CoreError::InvalidMaskLocation`] listing the legal locations for `kind`.
    pub fn invalid_mask_location(location: MaskLocation, kind: BackboneKind) -> Self {
        let supported = kind
            .supported_locations()
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Self::InvalidMaskLocation {
            location,
            kind,
            supported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_mask_location_lists_supported() {
        let err = CoreError::invalid_mask_location(MaskLocation::PreSoftmax, BackboneKind::ResNet);
        let msg = err.to_string();
        assert!(msg.contains("pre-softmax"));
        assert!(msg.contains("zero-input"));
        assert!(msg.contains("ResNet"));
    }
}
