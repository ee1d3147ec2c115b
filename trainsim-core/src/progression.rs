//! Synthetic per-epoch metric curves.
//!
//! Accuracy rises linearly from `baseline` by `spread` over the run, loss
//! decays exponentially from `initial_loss`, and validation metrics trail
//! training metrics by `val_gap`. Each value is perturbed by bounded noise
//! from a [`NoiseSource`].

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::config::ProgressionConfig;
use crate::error::{Result, TrainingError};
use crate::types::{EpochMetrics, TrainingRun};

/// Which metric a noise sample perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoiseStream {
    Accuracy = 1,
    Loss = 2,
    ValAccuracy = 3,
    ValLoss = 4,
}

/// Source of noise samples in `-1.0..=1.0`.
pub trait NoiseSource: Send + Sync {
    fn sample(&self, run_id: Uuid, epoch: u32, stream: NoiseStream) -> f64;
}

/// Deterministic noise keyed by `(seed, run id, epoch, stream)`.
///
/// Samples do not depend on call order, so a paused and resumed run draws
/// exactly the values it would have drawn uninterrupted.
#[derive(Debug, Clone, Copy)]
pub struct SeededNoise {
    seed: u64,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl NoiseSource for SeededNoise {
    fn sample(&self, run_id: Uuid, epoch: u32, stream: NoiseStream) -> f64 {
        let id = run_id.as_u128();
        let run_bits = ((id >> 64) as u64).rotate_left(17) ^ (id as u64);
        let key = self.seed ^ run_bits ^ (u64::from(epoch) << 8) ^ stream as u64;
        StdRng::seed_from_u64(key).gen_range(-1.0..=1.0)
    }
}

/// Noise source that always returns zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroNoise;

impl NoiseSource for ZeroNoise {
    fn sample(&self, _run_id: Uuid, _epoch: u32, _stream: NoiseStream) -> f64 {
        0.0
    }
}

/// Computes the metrics of one epoch of a run.
///
/// An `Err` is a scheduler fault: the scheduler fails the run and stops.
pub trait ProgressionModel: Send + Sync {
    fn compute(&self, run: &TrainingRun, epoch: u32) -> Result<EpochMetrics>;
}

/// The default curve model.
#[derive(Clone)]
pub struct SyntheticProgression {
    config: ProgressionConfig,
    noise: Arc<dyn NoiseSource>,
}

impl SyntheticProgression {
    pub fn new(config: ProgressionConfig, noise: Arc<dyn NoiseSource>) -> Self {
        Self { config, noise }
    }

    /// Build from config with [`SeededNoise`] seeded by `config.seed`.
    pub fn seeded(config: ProgressionConfig) -> Self {
        let noise = Arc::new(SeededNoise::new(config.seed));
        Self::new(config, noise)
    }
}

impl std::fmt::Debug for SyntheticProgression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticProgression")
            .field("config", &self.config)
            .finish()
    }
}

impl ProgressionModel for SyntheticProgression {
    fn compute(&self, run: &TrainingRun, epoch: u32) -> Result<EpochMetrics> {
        if epoch == 0 || epoch > run.epochs_total {
            return Err(TrainingError::invalid_input(format!(
                "epoch {epoch} is outside 1..={}",
                run.epochs_total
            )));
        }
        let c = &self.config;
        let progress = f64::from(epoch) / f64::from(run.epochs_total);
        let noise = |stream| self.noise.sample(run.id, epoch, stream) * c.noise_amplitude;

        let accuracy = (c.baseline + progress * c.spread + noise(NoiseStream::Accuracy))
            .clamp(0.0, c.ceiling);
        let loss =
            (c.initial_loss * (-c.loss_decay * progress).exp() + noise(NoiseStream::Loss)).max(0.0);
        let val_accuracy = (accuracy - c.val_gap + noise(NoiseStream::ValAccuracy) * 0.5)
            .clamp(0.0, c.ceiling);
        let val_loss = (loss + c.val_gap + noise(NoiseStream::ValLoss) * 0.5).max(0.0);

        let metrics = EpochMetrics {
            accuracy,
            loss,
            val_accuracy: Some(val_accuracy),
            val_loss: Some(val_loss),
        };
        if [accuracy, loss, val_accuracy, val_loss]
            .iter()
            .any(|v| !v.is_finite())
        {
            return Err(TrainingError::invalid_input(format!(
                "non-finite metrics at epoch {epoch}: {metrics:?}"
            )));
        }
        Ok(metrics)
    }
}
