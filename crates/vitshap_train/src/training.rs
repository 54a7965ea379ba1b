//! Surrogate training loop.
//!
//! The surrogate is fit to a frozen [`TargetModel`]: every batch of images is
//! fed unmasked to the target and masked to the surrogate, and the surrogate is
//! updated to match the target's logits.

use std::path::PathBuf;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use vitshap_models::{save_training_checkpoint, CheckpointMetric, SurrogateModel, TrainingCheckpoint};

use crate::error::{Result, TrainError};
use crate::metrics::{EpochSummary, Phase, SurrogateMetrics};
use crate::scheduler::{set_schedule, OptimizerSpec, ScheduleConfig, Scheduler, WarmupCosineLR};
use crate::target::TargetModel;

/// A batch of images with their player masks.
#[derive(Debug, Clone)]
pub struct SurrogateBatch<B: Backend> {
    /// Images `(B, C, H, W)`.
    pub images: Tensor<B, 4>,
    /// Player masks `(B, num_players)`, 1 keeps a player and 0 removes it.
    pub masks: Tensor<B, 2>,
}

impl<B: Backend> SurrogateBatch<B> {
    /// Create a batch.
    pub fn new(images: Tensor<B, 4>, masks: Tensor<B, 2>) -> Self {
        Self { images, masks }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    /// Whether the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Metric used to pick the best checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMetricKind {
    /// Mean loss, lower is better.
    #[default]
    Loss,
    /// Agreement with the target, higher is better.
    Agreement,
}

impl CheckpointMetricKind {
    /// Metric name without the phase prefix.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CheckpointMetricKind::Loss => "loss",
            CheckpointMetricKind::Agreement => "agreement",
        }
    }

    fn value(&self, summary: &EpochSummary) -> f64 {
        match self {
            CheckpointMetricKind::Loss => summary.loss,
            CheckpointMetricKind::Agreement => summary.agreement,
        }
    }

    fn improves(&self, candidate: f64, best: f64) -> bool {
        match self {
            CheckpointMetricKind::Loss => candidate < best,
            CheckpointMetricKind::Agreement => candidate > best,
        }
    }

    fn worst(&self) -> f64 {
        match self {
            CheckpointMetricKind::Loss => f64::INFINITY,
            CheckpointMetricKind::Agreement => f64::NEG_INFINITY,
        }
    }
}

/// Best value of the checkpoint metric seen so far.
#[derive(Debug, Clone, Copy)]
struct BestMetric {
    kind: CheckpointMetricKind,
    value: f64,
    epoch: Option<usize>,
}

impl BestMetric {
    fn new(kind: CheckpointMetricKind) -> Self {
        Self {
            kind,
            value: kind.worst(),
            epoch: None,
        }
    }

    /// Offer the metric of `epoch`; returns whether it is the new best.
    /// Non-finite values never win.
    fn update(&mut self, epoch: usize, value: f64) -> bool {
        if !value.is_finite() {
            tracing::warn!(
                "Epoch {} produced a non-finite {} ({}); best checkpoint unchanged",
                epoch + 1,
                self.kind.as_str(),
                value
            );
            return false;
        }
        if self.epoch.is_none() || self.kind.improves(value, self.value) {
            self.value = value;
            self.epoch = Some(epoch);
            return true;
        }
        false
    }
}

/// Configuration for [`SurrogateTrainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Number of epochs.
    pub n_epochs: usize,
    /// Optimizer and learning rate schedule.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Metric deciding the best epoch.
    #[serde(default)]
    pub checkpoint_metric: CheckpointMetricKind,
    /// Directory receiving `best.mpk`; nothing is written if unset.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            n_epochs: 10,
            schedule: ScheduleConfig::default(),
            checkpoint_metric: CheckpointMetricKind::Loss,
            checkpoint_dir: None,
        }
    }
}

/// Metrics of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Training summary.
    pub train: EpochSummary,
    /// Validation summary, if validation batches were given.
    pub valid: Option<EpochSummary>,
}

/// Result of [`SurrogateTrainer::fit`].
#[derive(Debug)]
pub struct FitOutput<B: AutodiffBackend> {
    /// Model of the best epoch.
    pub model: SurrogateModel<B>,
    /// Per-epoch history.
    pub history: Vec<EpochRecord>,
    /// Best epoch.
    pub best_epoch: usize,
    /// Checkpoint metric at the best epoch.
    pub best_metric: f64,
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Total training time in seconds.
    pub training_time_secs: f64,
}

/// Trains a [`SurrogateModel`] to imitate a frozen target.
pub struct SurrogateTrainer<B: AutodiffBackend, T: TargetModel<B::InnerBackend>> {
    config: TrainerConfig,
    target: T,
    metrics: SurrogateMetrics,
    device: B::Device,
}

impl<B, T> SurrogateTrainer<B, T>
where
    B: AutodiffBackend,
    T: TargetModel<B::InnerBackend>,
{
    /// Create a trainer. The target is switched to inference mode.
    pub fn new(
        config: TrainerConfig,
        mut target: T,
        target_type: vitshap_core::TargetType,
        device: B::Device,
    ) -> Self {
        target.set_eval();
        Self {
            config,
            target,
            metrics: SurrogateMetrics::set_metrics(target_type),
            device,
        }
    }

    /// Trainer configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// The frozen target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Metric accumulators.
    pub fn metrics_mut(&mut self) -> &mut SurrogateMetrics {
        &mut self.metrics
    }

    /// Target logits for `images`, computed on the target's device and
    /// returned on the device the images came from.
    fn target_logits(&self, images: Tensor<B::InnerBackend, 4>) -> Result<Tensor<B::InnerBackend, 2>> {
        let device = images.device();
        let images = images.to_device(&self.target.device());
        Ok(self.target.forward(images)?.logits.to_device(&device))
    }

    /// Loss of one training batch, recorded under [`Phase::Train`].
    ///
    /// # Errors
    ///
    /// Returns an error if the target or surrogate forward fails or the logit
    /// shapes differ.
    pub fn training_step(
        &mut self,
        model: &SurrogateModel<B>,
        batch: &SurrogateBatch<B>,
    ) -> Result<Tensor<B, 1>> {
        let logits_target: Tensor<B, 2> = Tensor::from_inner(self.target_logits(batch.images.clone().inner())?);
        let logits = model
            .masked_forward(batch.images.clone(), batch.masks.clone(), None)?
            .logits;
        self.metrics.compute_metrics(Phase::Train, logits, logits_target)
    }

    /// Record one validation batch.
    ///
    /// # Errors
    ///
    /// See [`SurrogateTrainer::training_step`].
    pub fn validation_step(
        &mut self,
        model: &SurrogateModel<B::InnerBackend>,
        batch: &SurrogateBatch<B::InnerBackend>,
    ) -> Result<()> {
        self.eval_step(Phase::Val, model, batch)
    }

    /// Record one test batch.
    ///
    /// # Errors
    ///
    /// See [`SurrogateTrainer::training_step`].
    pub fn test_step(
        &mut self,
        model: &SurrogateModel<B::InnerBackend>,
        batch: &SurrogateBatch<B::InnerBackend>,
    ) -> Result<()> {
        self.eval_step(Phase::Test, model, batch)
    }

    fn eval_step(
        &mut self,
        phase: Phase,
        model: &SurrogateModel<B::InnerBackend>,
        batch: &SurrogateBatch<B::InnerBackend>,
    ) -> Result<()> {
        let logits_target = self.target_logits(batch.images.clone())?;
        let logits = model
            .masked_forward(batch.images.clone(), batch.masks.clone(), None)?
            .logits;
        self.metrics.compute_metrics(phase, logits, logits_target)?;
        Ok(())
    }

    /// Evaluate `model` on test batches.
    ///
    /// # Errors
    ///
    /// See [`SurrogateTrainer::training_step`].
    pub fn test(
        &mut self,
        model: &SurrogateModel<B>,
        batches: &[SurrogateBatch<B::InnerBackend>],
    ) -> Result<EpochSummary> {
        let inner = model.clone().valid();
        for batch in batches {
            self.test_step(&inner, batch)?;
        }
        Ok(self.metrics.epoch_wrapup(Phase::Test))
    }

    /// Train for `n_epochs`, keeping the model of the best epoch.
    ///
    /// The best epoch is chosen on validation metrics, or on training metrics
    /// when `valid` is empty.
    ///
    /// # Errors
    ///
    /// - [`TrainError::InvalidConfig`] if there are no training batches or no epochs
    /// - schedule, forward or checkpoint errors
    pub fn fit(
        &mut self,
        model: SurrogateModel<B>,
        train: &[SurrogateBatch<B>],
        valid: &[SurrogateBatch<B::InnerBackend>],
    ) -> Result<FitOutput<B>> {
        if train.is_empty() {
            return Err(TrainError::InvalidConfig("no training batches".to_string()));
        }
        if self.config.n_epochs == 0 {
            return Err(TrainError::InvalidConfig("n_epochs must be positive".to_string()));
        }
        let total_steps = self.config.n_epochs * train.len();
        let schedule = set_schedule(&self.config.schedule, total_steps)?;

        match schedule.optimizer {
            OptimizerSpec::Adam(config) => {
                let optim = config.init::<B, SurrogateModel<B>>();
                self.fit_with(model, optim, &schedule.scheduler, train, valid)
            }
            OptimizerSpec::AdamW(config) => {
                let optim = config.init::<B, SurrogateModel<B>>();
                self.fit_with(model, optim, &schedule.scheduler, train, valid)
            }
            OptimizerSpec::Sgd(config) => {
                let optim = config.init::<B, SurrogateModel<B>>();
                self.fit_with(model, optim, &schedule.scheduler, train, valid)
            }
        }
    }

    fn fit_with<O>(
        &mut self,
        model: SurrogateModel<B>,
        mut optim: O,
        scheduler: &WarmupCosineLR,
        train: &[SurrogateBatch<B>],
        valid: &[SurrogateBatch<B::InnerBackend>],
    ) -> Result<FitOutput<B>>
    where
        O: Optimizer<SurrogateModel<B>, B>,
    {
        let start_time = Instant::now();
        let metric_kind = self.config.checkpoint_metric;
        tracing::info!(
            "Training surrogate for {} epochs ({} steps/epoch, {} scheduler) on {:?}",
            self.config.n_epochs,
            train.len(),
            scheduler.name(),
            self.device
        );

        let mut current_model = model;
        let mut best_model = current_model.clone();
        let mut best = BestMetric::new(metric_kind);
        let mut history = Vec::with_capacity(self.config.n_epochs);
        let mut global_step = 0;

        for epoch in 0..self.config.n_epochs {
            for batch in train {
                let lr = scheduler.get_lr(global_step);
                let loss = self.training_step(&current_model, batch)?;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &current_model);
                current_model = optim.step(lr, current_model, grads);
                global_step += 1;
            }
            let train_summary = self.metrics.epoch_wrapup(Phase::Train);

            let valid_summary = if valid.is_empty() {
                None
            } else {
                let inner = current_model.clone().valid();
                for batch in valid {
                    self.validation_step(&inner, batch)?;
                }
                Some(self.metrics.epoch_wrapup(Phase::Val))
            };

            let monitored = valid_summary.as_ref().unwrap_or(&train_summary);
            let value = metric_kind.value(monitored);
            let improved = best.update(epoch, value);
            if improved {
                best_model = current_model.clone();
                self.save_best(&best_model, epoch, global_step, monitored.phase, value)?;
            }

            tracing::info!(
                "Epoch {:3}/{}: train/loss={:.4}, {}/{}={:.4}{}",
                epoch + 1,
                self.config.n_epochs,
                train_summary.loss,
                monitored.phase,
                metric_kind.as_str(),
                value,
                if improved { " *" } else { "" }
            );

            history.push(EpochRecord {
                epoch,
                train: train_summary,
                valid: valid_summary,
            });
        }

        let training_time_secs = start_time.elapsed().as_secs_f64();
        let best_epoch = match best.epoch {
            Some(epoch) => epoch,
            None => {
                tracing::warn!(
                    "No epoch produced a finite {}; returning the initial model",
                    metric_kind.as_str()
                );
                0
            }
        };
        let best_metric = best.value;
        tracing::info!(
            "Training complete in {:.1}s, best {} {:.4} at epoch {}",
            training_time_secs,
            metric_kind.as_str(),
            best_metric,
            best_epoch + 1
        );

        Ok(FitOutput {
            model: best_model,
            history,
            best_epoch,
            best_metric,
            global_step,
            training_time_secs,
        })
    }

    fn save_best(
        &self,
        model: &SurrogateModel<B>,
        epoch: usize,
        global_step: usize,
        phase: Phase,
        value: f64,
    ) -> Result<()> {
        let Some(dir) = &self.config.checkpoint_dir else {
            return Ok(());
        };
        let name = format!("{}/{}", phase, self.config.checkpoint_metric.as_str());
        let path = save_training_checkpoint::<B>(
            TrainingCheckpoint {
                state_dict: model.state_dict(),
                epoch,
                global_step,
                metric: Some(CheckpointMetric { name, value }),
            },
            dir.join("best.mpk"),
        )?;
        tracing::debug!("Saved best checkpoint to {}", path.display());
        Ok(())
    }
}
