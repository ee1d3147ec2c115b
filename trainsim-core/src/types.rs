//! Training run, metric and model records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and failed runs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether the state machine has an edge from `self` to `to`.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Paused)
                | (RunStatus::Paused, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Parameters accepted by `RunController::create_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    pub model_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<Uuid>,
    pub epochs_total: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
}

/// One simulated training run.
///
/// Hyperparameters are private so they cannot change once the run exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: Uuid,
    pub model_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<Uuid>,
    pub status: RunStatus,
    pub epochs_total: u32,
    pub epochs_completed: u32,
    pub accuracy: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub loss: Option<f64>,
    pub val_loss: Option<f64>,
    learning_rate: f64,
    batch_size: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingRun {
    /// Create a pending run with no progress.
    pub fn new(params: &NewRun) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            model_id: params.model_id,
            dataset_id: params.dataset_id,
            status: RunStatus::Pending,
            epochs_total: params.epochs_total,
            epochs_completed: 0,
            accuracy: None,
            val_accuracy: None,
            loss: None,
            val_loss: None,
            learning_rate: params.learning_rate,
            batch_size: params.batch_size,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// The epoch the next tick will produce.
    pub fn next_epoch(&self) -> u32 {
        self.epochs_completed + 1
    }

    /// Apply a progress write. Callers must have validated it first.
    pub(crate) fn apply(&mut self, update: &ProgressUpdate) {
        self.status = update.status;
        self.epochs_completed = update.epochs_completed;
        self.accuracy = Some(update.metrics.accuracy);
        self.loss = Some(update.metrics.loss);
        self.val_accuracy = update.metrics.val_accuracy;
        self.val_loss = update.metrics.val_loss;
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        self.updated_at = Utc::now();
    }

    /// Drop all progress and return to `pending`.
    pub(crate) fn reset(&mut self) {
        self.status = RunStatus::Pending;
        self.epochs_completed = 0;
        self.accuracy = None;
        self.val_accuracy = None;
        self.loss = None;
        self.val_loss = None;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.updated_at = Utc::now();
    }
}

/// Metric values produced by one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub accuracy: f64,
    pub loss: f64,
    pub val_accuracy: Option<f64>,
    pub val_loss: Option<f64>,
}

/// All progress fields of a run, written together in one registry call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: RunStatus,
    pub epochs_completed: u32,
    pub metrics: EpochMetrics,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Stored metric row, keyed by `(run_id, epoch)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetric {
    pub run_id: Uuid,
    pub epoch: u32,
    pub accuracy: f64,
    pub loss: f64,
    pub val_accuracy: Option<f64>,
    pub val_loss: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ModelMetric {
    pub fn new(run_id: Uuid, epoch: u32, metrics: EpochMetrics) -> Self {
        Self {
            run_id,
            epoch,
            accuracy: metrics.accuracy,
            loss: metrics.loss,
            val_accuracy: metrics.val_accuracy,
            val_loss: metrics.val_loss,
            created_at: Utc::now(),
        }
    }
}

/// Status of a model record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Created,
    Training,
    Deployed,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelStatus::Created => write!(f, "created"),
            ModelStatus::Training => write!(f, "training"),
            ModelStatus::Deployed => write!(f, "deployed"),
        }
    }
}

/// A model whose cached metrics reflect its most recent completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiModel {
    pub id: Uuid,
    pub name: String,
    pub status: ModelStatus,
    pub accuracy: Option<f64>,
    pub latency_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AiModel {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ModelStatus::Created,
            accuracy: None,
            latency_ms: None,
            error_rate: None,
            deployed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Client-facing view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub id: Uuid,
    pub model_id: Uuid,
    pub status: RunStatus,
    pub epochs_total: u32,
    pub epochs_completed: u32,
    pub accuracy: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&TrainingRun> for RunView {
    fn from(run: &TrainingRun) -> Self {
        Self {
            id: run.id,
            model_id: run.model_id,
            status: run.status,
            epochs_total: run.epochs_total,
            epochs_completed: run.epochs_completed,
            accuracy: run.accuracy,
            val_accuracy: run.val_accuracy,
            loss: run.loss,
            val_loss: run.val_loss,
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

/// Client-facing view of one epoch's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub epoch: u32,
    pub accuracy: f64,
    pub loss: f64,
    pub val_accuracy: Option<f64>,
    pub val_loss: Option<f64>,
}

impl From<&ModelMetric> for MetricPoint {
    fn from(m: &ModelMetric) -> Self {
        Self {
            epoch: m.epoch,
            accuracy: m.accuracy,
            loss: m.loss,
            val_accuracy: m.val_accuracy,
            val_loss: m.val_loss,
        }
    }
}
