//! Storage seams for runs, metric series and models.
//!
//! Each trait has an in-memory backend and a JSON-file backend. Both share
//! the same table types so the validation rules live in one place.

mod file;
mod memory;

pub use file::{FileMetricSeries, FileModelStore, FileRunRegistry};
pub use memory::{InMemoryMetricSeries, InMemoryModelStore, InMemoryRunRegistry};

use std::sync::{Arc, PoisonError};

use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, TrainingError};
use crate::types::{AiModel, ModelMetric, ProgressUpdate, RunStatus, TrainingRun};

/// Store of training run records.
///
/// Every write replaces the affected record in one step, so readers observe
/// either the old or the new record and never a mix of the two.
pub trait RunRegistry: Send + Sync {
    /// Insert a new run. Fails if the id is already present.
    fn create(&self, run: TrainingRun) -> Result<Uuid>;

    fn get(&self, id: Uuid) -> Result<TrainingRun>;

    /// All runs, oldest first.
    fn list(&self) -> Result<Vec<TrainingRun>>;

    fn list_by_model(&self, model_id: Uuid) -> Result<Vec<TrainingRun>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.model_id == model_id)
            .collect())
    }

    fn list_by_status(&self, status: RunStatus) -> Result<Vec<TrainingRun>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Compare-and-set the status. Fails with `InvalidTransition` unless the
    /// run is currently `from` and `from -> to` is a legal edge.
    fn set_status(&self, id: Uuid, from: RunStatus, to: RunStatus) -> Result<TrainingRun>;

    /// Write every progress field of a run at once.
    fn update_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<TrainingRun>;

    /// Force a non-terminal run to `failed`, recording `message`.
    fn fail(&self, id: Uuid, message: &str) -> Result<TrainingRun>;

    /// Return a non-terminal run to `pending` with zeroed progress.
    fn reset(&self, id: Uuid) -> Result<TrainingRun>;

    fn delete(&self, id: Uuid) -> Result<()>;
}

/// Append-only per-run metric history.
pub trait MetricSeries: Send + Sync {
    /// Append the next epoch. The epoch must be exactly one past the last.
    fn append(&self, metric: ModelMetric) -> Result<()>;

    /// All points of a run in ascending epoch order.
    fn list(&self, run_id: Uuid) -> Result<Vec<ModelMetric>>;

    /// The last `limit` points of a run in ascending epoch order.
    fn recent(&self, run_id: Uuid, limit: usize) -> Result<Vec<ModelMetric>> {
        let mut all = self.list(run_id)?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    fn len(&self, run_id: Uuid) -> Result<usize> {
        Ok(self.list(run_id)?.len())
    }

    /// Remove the latest point if it is `epoch`. Returns whether a point was removed.
    ///
    /// Only the scheduler uses this, to undo its own append when the matching
    /// registry write fails, and reconciliation, to drop a trailing point the
    /// registry never acknowledged.
    fn retract(&self, run_id: Uuid, epoch: u32) -> Result<bool>;

    /// Delete the whole series of a run. Only called when the run is deleted.
    fn delete_run(&self, run_id: Uuid) -> Result<()>;
}

/// Store of model records.
pub trait ModelStore: Send + Sync {
    fn insert(&self, model: AiModel) -> Result<Uuid>;

    fn get(&self, id: Uuid) -> Result<AiModel>;

    fn list(&self) -> Result<Vec<AiModel>>;

    /// Read-modify-write a model under the store's lock.
    fn modify(&self, id: Uuid, f: &mut dyn FnMut(&mut AiModel)) -> Result<AiModel>;
}

/// The three stores the engine runs on.
#[derive(Clone)]
pub struct Stores {
    pub runs: Arc<dyn RunRegistry>,
    pub metrics: Arc<dyn MetricSeries>,
    pub models: Arc<dyn ModelStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            runs: Arc::new(InMemoryRunRegistry::new()),
            metrics: Arc::new(InMemoryMetricSeries::new()),
            models: Arc::new(InMemoryModelStore::new()),
        }
    }

    /// Open the backend selected by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::File => {
                let dir = config.resolved_data_dir().ok_or_else(|| {
                    TrainingError::invalid_input("storage.data_dir is required for the file backend")
                })?;
                tracing::info!(data_dir = %dir.display(), "Opening file-backed stores");
                Ok(Self {
                    runs: Arc::new(FileRunRegistry::open(dir.join("runs.json"))?),
                    metrics: Arc::new(FileMetricSeries::open(dir.join("metrics"))?),
                    models: Arc::new(FileModelStore::open(dir.join("models.json"))?),
                })
            }
        }
    }
}

pub(crate) fn poisoned<T>(_: PoisonError<T>) -> TrainingError {
    TrainingError::storage("store lock poisoned")
}
