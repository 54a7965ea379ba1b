//! Error types for training.

use thiserror::Error;

/// Result type alias for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Errors that can occur during training.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Invalid learning rate.
    #[error("Invalid learning rate: {0}")]
    InvalidLearningRate(String),

    /// Invalid trainer or schedule configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The target model could not produce logits.
    #[error("Target model failed: {0}")]
    TargetError(String),

    /// Target and surrogate logits disagree in shape.
    #[error("Logit shape mismatch: surrogate {surrogate:?}, target {target:?}")]
    LogitShapeMismatch {
        /// Surrogate logits shape.
        surrogate: [usize; 2],
        /// Target logits shape.
        target: [usize; 2],
    },

    /// Core error (model construction, masking, checkpoints).
    #[error("Core error: {0}")]
    CoreError(#[from] vitshap_core::CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}
