//! Optimizer selection and learning rate schedules.

use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, AdamWConfig, SgdConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Trait for learning rate schedulers.
pub trait Scheduler: Send + Sync {
    /// Get the learning rate for the current step.
    fn get_lr(&self, step: usize) -> f64;

    /// Get the scheduler name.
    fn name(&self) -> &str;
}

/// Linear warmup from 0 to `peak_lr`, then cosine decay to 0.
#[derive(Debug, Clone)]
pub struct WarmupCosineLR {
    peak_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl WarmupCosineLR {
    /// Create a new scheduler.
    pub fn new(peak_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            peak_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps,
        }
    }

    /// Warmup length in steps.
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

impl Scheduler for WarmupCosineLR {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        self.peak_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }

    fn name(&self) -> &str {
        "WarmupCosineLR"
    }
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimType {
    /// Adam with L2 weight decay.
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
    /// SGD with momentum.
    Sgd,
}

/// Shape of the decay after warmup. Only cosine annealing is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayPower {
    /// Cosine annealing to zero.
    #[default]
    Cosine,
}

/// Warmup length, absolute or as a fraction of all steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Warmup {
    /// Absolute number of steps.
    Steps(usize),
    /// Fraction of the total steps.
    Ratio(f64),
}

impl Warmup {
    /// Number of warmup steps out of `total_steps`.
    pub fn resolve(&self, total_steps: usize) -> usize {
        match *self {
            Warmup::Steps(steps) => steps,
            Warmup::Ratio(ratio) => (total_steps as f64 * ratio).round() as usize,
        }
    }
}

impl Default for Warmup {
    fn default() -> Self {
        Warmup::Steps(0)
    }
}

/// Optimizer and schedule hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Optimizer family.
    pub optim_type: OptimType,
    /// Peak learning rate.
    pub learning_rate: f64,
    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,
    /// Decay after warmup.
    #[serde(default)]
    pub decay_power: DecayPower,
    /// Warmup length.
    #[serde(default)]
    pub warmup_steps: Warmup,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            optim_type: OptimType::AdamW,
            learning_rate: 1e-5,
            weight_decay: 1e-5,
            decay_power: DecayPower::Cosine,
            warmup_steps: Warmup::Ratio(0.05),
        }
    }
}

impl ScheduleConfig {
    /// Check the hyperparameters.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::InvalidLearningRate`] for a non-positive or
    /// non-finite learning rate and [`TrainError::InvalidConfig`] for negative
    /// weight decay or a warmup ratio outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainError::InvalidLearningRate(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(TrainError::InvalidConfig(format!(
                "weight decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        if let Warmup::Ratio(r) = self.warmup_steps {
            if !(0.0..=1.0).contains(&r) {
                return Err(TrainError::InvalidConfig(format!(
                    "warmup ratio must be in [0, 1], got {}",
                    r
                )));
            }
        }
        Ok(())
    }
}

/// Optimizer configuration picked by [`set_schedule`].
#[derive(Debug, Clone)]
pub enum OptimizerSpec {
    /// Adam.
    Adam(AdamConfig),
    /// AdamW.
    AdamW(AdamWConfig),
    /// SGD.
    Sgd(SgdConfig),
}

/// Optimizer plus learning rate schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Optimizer configuration.
    pub optimizer: OptimizerSpec,
    /// Learning rate per step.
    pub scheduler: WarmupCosineLR,
}

/// Build the optimizer and schedule for `total_steps` optimizer steps.
///
/// # Errors
///
/// Returns an error if [`ScheduleConfig::validate`] fails.
pub fn set_schedule(config: &ScheduleConfig, total_steps: usize) -> Result<Schedule> {
    config.validate()?;
    let weight_decay = config.weight_decay as f32;

    let optimizer = match config.optim_type {
        OptimType::Adam => OptimizerSpec::Adam(
            AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(weight_decay))),
        ),
        OptimType::AdamW => OptimizerSpec::AdamW(
            AdamWConfig::new()
                .with_beta_1(0.9)
                .with_beta_2(0.98)
                .with_epsilon(1e-6)
                .with_weight_decay(weight_decay),
        ),
        OptimType::Sgd => OptimizerSpec::Sgd(
            SgdConfig::new()
                .with_weight_decay(Some(WeightDecayConfig::new(weight_decay)))
                .with_momentum(Some(MomentumConfig::new().with_momentum(0.9))),
        ),
    };

    let warmup = config.warmup_steps.resolve(total_steps);
    let scheduler = match config.decay_power {
        DecayPower::Cosine => WarmupCosineLR::new(config.learning_rate, warmup, total_steps),
    };
    tracing::debug!(
        "{:?} optimizer, lr {} with {} warmup steps of {}",
        config.optim_type,
        config.learning_rate,
        scheduler.warmup_steps(),
        total_steps
    );

    Ok(Schedule {
        optimizer,
        scheduler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_then_cosine() {
        let scheduler = WarmupCosineLR::new(1.0, 4, 12);
        assert!((scheduler.get_lr(0) - 0.25).abs() < 1e-12);
        assert!((scheduler.get_lr(3) - 1.0).abs() < 1e-12);
        assert!((scheduler.get_lr(4) - 1.0).abs() < 1e-12);
        assert!((scheduler.get_lr(8) - 0.5).abs() < 1e-12);
        assert!(scheduler.get_lr(12).abs() < 1e-12);
        assert!(scheduler.get_lr(100).abs() < 1e-12);
    }

    #[test]
    fn test_no_warmup() {
        let scheduler = WarmupCosineLR::new(0.1, 0, 10);
        assert!((scheduler.get_lr(0) - 0.1).abs() < 1e-12);
        assert!(scheduler.get_lr(5) < 0.1);
    }

    #[test]
    fn test_warmup_ratio() {
        assert_eq!(Warmup::Ratio(0.1).resolve(200), 20);
        assert_eq!(Warmup::Steps(7).resolve(200), 7);

        let parsed: Warmup = serde_json::from_str("0.05").unwrap();
        assert_eq!(parsed, Warmup::Ratio(0.05));
        let parsed: Warmup = serde_json::from_str("500").unwrap();
        assert_eq!(parsed, Warmup::Steps(500));
    }

    #[test]
    fn test_schedule_config_json() {
        let config: ScheduleConfig =
            serde_json::from_str(r#"{ "optim_type": "adamw", "learning_rate": 1e-4, "warmup_steps": 0.1 }"#)
                .unwrap();
        assert_eq!(config.optim_type, OptimType::AdamW);
        assert_eq!(config.decay_power, DecayPower::Cosine);

        let schedule = set_schedule(&config, 100).unwrap();
        assert!(matches!(schedule.optimizer, OptimizerSpec::AdamW(_)));
        assert_eq!(schedule.scheduler.warmup_steps(), 10);
    }

    #[test]
    fn test_invalid_learning_rate() {
        let config = ScheduleConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            set_schedule(&config, 10),
            Err(TrainError::InvalidLearningRate(_))
        ));
    }
}
