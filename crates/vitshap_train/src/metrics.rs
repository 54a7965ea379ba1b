//! Distillation loss and agreement metrics, accumulated per phase.

use std::fmt;

use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, log_softmax, sigmoid, softmax};
use serde::{Deserialize, Serialize};
use vitshap_core::TargetType;

use crate::error::{Result, TrainError};

/// Training phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Optimizer updates.
    Train,
    /// Validation.
    Val,
    /// Final evaluation.
    Test,
}

impl Phase {
    /// Phase name used as a metric prefix.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
            Phase::Test => "test",
        }
    }

    const fn index(&self) -> usize {
        match self {
            Phase::Train => 0,
            Phase::Val => 1,
            Phase::Test => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated metrics of one phase over one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Phase the metrics belong to.
    pub phase: Phase,
    /// Mean batch loss.
    pub loss: f64,
    /// Fraction of predictions agreeing with the target.
    pub agreement: f64,
    /// Batches seen.
    pub n_batches: usize,
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    loss_sum: f64,
    n_batches: usize,
    agree: usize,
    total: usize,
}

/// Loss between surrogate and target logits.
///
/// - multi-class: `KL(softmax(target) || softmax(logits))`, averaged over the batch
/// - binary / multi-label: binary cross-entropy of `logits` against `sigmoid(target)`
pub fn surrogate_loss<B: Backend>(
    target_type: TargetType,
    logits: Tensor<B, 2>,
    logits_target: Tensor<B, 2>,
) -> Tensor<B, 1> {
    match target_type {
        TargetType::MultiClass => {
            let p = softmax(logits_target.clone(), 1);
            let log_p = log_softmax(logits_target, 1);
            let log_q = log_softmax(logits, 1);
            (p * (log_p - log_q)).sum_dim(1).mean()
        }
        TargetType::Binary | TargetType::MultiLabel => {
            let p = sigmoid(logits_target);
            let pos = log_sigmoid(logits.clone());
            let neg = log_sigmoid(logits.neg());
            (p.clone() * pos + (p.neg() + 1.0) * neg).mean().neg()
        }
    }
}

/// Count predictions agreeing with the target: `(matches, total)`.
///
/// Multi-class compares argmax per sample; binary and multi-label compare the
/// sign of every logit.
pub fn agreement<B: Backend>(
    target_type: TargetType,
    logits: Tensor<B, 2>,
    logits_target: Tensor<B, 2>,
) -> (usize, usize) {
    let [batch, outputs] = logits.dims();
    match target_type {
        TargetType::MultiClass => {
            let matches: f32 = logits
                .argmax(1)
                .equal(logits_target.argmax(1))
                .int()
                .sum()
                .into_scalar()
                .elem();
            (matches as usize, batch)
        }
        TargetType::Binary | TargetType::MultiLabel => {
            let predicted = logits.greater_elem(0.0).int();
            let expected = logits_target.greater_elem(0.0).int();
            let matches: f32 = predicted.equal(expected).int().sum().into_scalar().elem();
            (matches as usize, batch * outputs)
        }
    }
}

/// Per-phase metric accumulators for surrogate training.
#[derive(Debug, Clone)]
pub struct SurrogateMetrics {
    target_type: TargetType,
    phases: [Accumulator; 3],
}

impl SurrogateMetrics {
    /// Set up metrics for `target_type`.
    pub fn set_metrics(target_type: TargetType) -> Self {
        Self {
            target_type,
            phases: Default::default(),
        }
    }

    /// How logits are interpreted.
    pub fn target_type(&self) -> TargetType {
        self.target_type
    }

    /// Compute the loss for a batch and record it under `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::LogitShapeMismatch`] if the logit shapes differ.
    pub fn compute_metrics<B: Backend>(
        &mut self,
        phase: Phase,
        logits: Tensor<B, 2>,
        logits_target: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        if logits.dims() != logits_target.dims() {
            return Err(TrainError::LogitShapeMismatch {
                surrogate: logits.dims(),
                target: logits_target.dims(),
            });
        }
        let (agree, total) = agreement(self.target_type, logits.clone(), logits_target.clone());
        let loss = surrogate_loss(self.target_type, logits, logits_target);
        let value: f64 = loss.clone().into_scalar().elem();

        let acc = &mut self.phases[phase.index()];
        acc.loss_sum += value;
        acc.n_batches += 1;
        acc.agree += agree;
        acc.total += total;
        Ok(loss)
    }

    /// Summarize `phase`, log the summary and reset its accumulator.
    pub fn epoch_wrapup(&mut self, phase: Phase) -> EpochSummary {
        let acc = std::mem::take(&mut self.phases[phase.index()]);
        let summary = EpochSummary {
            phase,
            loss: if acc.n_batches > 0 {
                acc.loss_sum / acc.n_batches as f64
            } else {
                0.0
            },
            agreement: if acc.total > 0 {
                acc.agree as f64 / acc.total as f64
            } else {
                0.0
            },
            n_batches: acc.n_batches,
        };
        tracing::info!(
            "{}/loss={:.4} {}/agreement={:.4} ({} batches)",
            phase,
            summary.loss,
            phase,
            summary.agreement,
            summary.n_batches
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn logits(values: &[f32], shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape(shape)
    }

    #[test]
    fn test_kl_is_zero_for_identical_logits() {
        let x = logits(&[1.0, 2.0, 3.0, -1.0, 0.0, 1.0], [2, 3]);
        let loss: f32 = surrogate_loss(TargetType::MultiClass, x.clone(), x)
            .into_scalar()
            .elem();
        assert!(loss.abs() < 1e-6);
    }

    #[test]
    fn test_kl_is_positive_for_different_logits() {
        let x = logits(&[3.0, 0.0, 0.0], [1, 3]);
        let y = logits(&[0.0, 3.0, 0.0], [1, 3]);
        let loss: f32 = surrogate_loss(TargetType::MultiClass, x, y).into_scalar().elem();
        assert!(loss > 0.1);
    }

    #[test]
    fn test_bce_against_soft_target() {
        // Target probability 0.5, logit 0 -> -ln(0.5).
        let x = logits(&[0.0], [1, 1]);
        let loss: f32 = surrogate_loss(TargetType::Binary, x.clone(), x).into_scalar().elem();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_agreement() {
        let x = logits(&[1.0, 0.0, 0.0, 1.0], [2, 2]);
        let y = logits(&[2.0, 0.0, 2.0, 0.0], [2, 2]);
        assert_eq!(agreement(TargetType::MultiClass, x.clone(), y.clone()), (1, 2));
        assert_eq!(agreement(TargetType::MultiLabel, x, y), (2, 4));
    }

    #[test]
    fn test_epoch_wrapup_resets() {
        let mut metrics = SurrogateMetrics::set_metrics(TargetType::MultiClass);
        let x = logits(&[1.0, 0.0], [1, 2]);
        metrics
            .compute_metrics(Phase::Val, x.clone(), x.clone())
            .unwrap();
        metrics.compute_metrics(Phase::Val, x.clone(), x).unwrap();

        let summary = metrics.epoch_wrapup(Phase::Val);
        assert_eq!(summary.n_batches, 2);
        assert_eq!(summary.agreement, 1.0);
        assert!(summary.loss.abs() < 1e-6);

        let empty = metrics.epoch_wrapup(Phase::Val);
        assert_eq!(empty.n_batches, 0);
        assert_eq!(metrics.epoch_wrapup(Phase::Train).n_batches, 0);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut metrics = SurrogateMetrics::set_metrics(TargetType::MultiClass);
        let result = metrics.compute_metrics(Phase::Train, logits(&[1.0, 0.0], [1, 2]), logits(&[1.0], [1, 1]));
        assert!(matches!(result, Err(TrainError::LogitShapeMismatch { .. })));
    }
}
