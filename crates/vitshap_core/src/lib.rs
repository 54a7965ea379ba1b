//! # vitshap_core
//!
//! Core types shared by the vitshap crates.
//!
//! This crate provides:
//! - [`MaskLocation`] and [`BackboneKind`] with the capability table deciding
//!   which masking strategies each backbone family supports
//! - [`TargetType`] for interpreting surrogate logits
//! - [`PlayerMask`] for validated `(batch, num_players)` mask tensors
//! - [`ImageShape`] and [`PatchGrid`] for image/player geometry
//! - [`CoreError`], the error taxonomy used across the workspace
//!
//! ## Shape Convention
//!
//! Images follow `(B, C, H, W)` and masks follow `(B, P)`:
//! - `B`: Batch size
//! - `C`: Color channels
//! - `H`, `W`: Image height and width in pixels
//! - `P`: Number of players (patches), in row-major patch order
//!
//! ## Example
//!
//! ```rust
//! use vitshap_core::{BackboneKind, MaskLocation};
//!
//! assert!(BackboneKind::Transformer.supports(MaskLocation::PreSoftmax));
//! assert!(!BackboneKind::ResNet.supports(MaskLocation::PreSoftmax));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod kind;
mod mask;
mod shape;
mod target;

pub use error::{CoreError, Result};
pub use kind::{BackboneKind, MaskLocation};
pub use mask::PlayerMask;
pub use shape::{ImageShape, PatchGrid, DEFAULT_NUM_PLAYERS};
pub use target::TargetType;

/// Backend type aliases for convenience
pub mod backend {
    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;

    #[cfg(feature = "backend-wgpu")]
    pub use burn_wgpu::Wgpu;
}
