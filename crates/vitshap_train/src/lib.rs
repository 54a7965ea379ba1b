//! # vitshap_train
//!
//! Fitting a masking-aware surrogate to a frozen target model.
//!
//! This crate provides:
//! - [`TargetModel`] and the ready-made [`FrozenClassifier`] target
//! - [`SurrogateMetrics`] with the distillation loss and agreement
//! - [`set_schedule`] building the optimizer and a warmup + cosine schedule
//! - [`SurrogateTrainer`] with per-phase steps, `fit` and best-checkpoint saving
//!
//! ## Example
//!
//! ```rust,ignore
//! use vitshap_train::{FrozenClassifier, SurrogateTrainer, TrainerConfig};
//!
//! let target = FrozenClassifier::from_registry(&registry, "vit_base_patch16_224", &overrides, &device)?;
//! let mut trainer = SurrogateTrainer::<Autodiff<NdArray>, _>::new(config, target, TargetType::MultiClass, device);
//! let output = trainer.fit(surrogate, &train, &valid)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod target;
pub mod training;

pub use error::{Result, TrainError};
pub use metrics::{agreement, surrogate_loss, EpochSummary, Phase, SurrogateMetrics};
pub use scheduler::{
    set_schedule, DecayPower, OptimType, OptimizerSpec, Schedule, ScheduleConfig, Scheduler,
    Warmup, WarmupCosineLR,
};
pub use target::{FrozenClassifier, TargetModel, TargetOutput};
pub use training::{
    CheckpointMetricKind, EpochRecord, FitOutput, SurrogateBatch, SurrogateTrainer, TrainerConfig,
};
