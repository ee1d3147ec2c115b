//! In-memory store backends and the tables shared with the file backends.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use super::{MetricSeries, ModelStore, RunRegistry, poisoned};
use crate::error::{Result, TrainingError};
use crate::types::{AiModel, ModelMetric, ProgressUpdate, RunStatus, TrainingRun};

#[derive(Debug, Clone, Default)]
pub(crate) struct RunTable {
    runs: HashMap<Uuid, TrainingRun>,
}

impl RunTable {
    pub(crate) fn from_runs(runs: Vec<TrainingRun>) -> Self {
        Self {
            runs: runs.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    /// All runs ordered by creation time.
    pub(crate) fn snapshot(&self) -> Vec<TrainingRun> {
        let mut runs: Vec<TrainingRun> = self.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        runs
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut TrainingRun> {
        self.runs
            .get_mut(&id)
            .ok_or(TrainingError::RunNotFound { id })
    }

    pub(crate) fn get(&self, id: Uuid) -> Result<TrainingRun> {
        self.runs
            .get(&id)
            .cloned()
            .ok_or(TrainingError::RunNotFound { id })
    }

    pub(crate) fn create(&mut self, run: TrainingRun) -> Result<Uuid> {
        if self.runs.contains_key(&run.id) {
            return Err(TrainingError::invalid_input(format!(
                "run {} already exists",
                run.id
            )));
        }
        let id = run.id;
        self.runs.insert(id, run);
        Ok(id)
    }

    pub(crate) fn set_status(
        &mut self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<TrainingRun> {
        if to.is_terminal() {
            return Err(TrainingError::invalid_input(
                "terminal statuses are only written by progress updates or failures",
            ));
        }
        let run = self.get_mut(id)?;
        if run.status != from || !from.can_transition_to(to) {
            return Err(TrainingError::InvalidTransition {
                run_id: id,
                from: run.status,
                to,
            });
        }
        let now = Utc::now();
        run.status = to;
        if to == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        run.updated_at = now;
        Ok(run.clone())
    }

    pub(crate) fn update_progress(
        &mut self,
        id: Uuid,
        update: &ProgressUpdate,
    ) -> Result<TrainingRun> {
        let run = self.get_mut(id)?;
        if run.status != RunStatus::Running {
            return Err(TrainingError::InvalidTransition {
                run_id: id,
                from: run.status,
                to: update.status,
            });
        }
        if update.epochs_completed != run.epochs_completed + 1 {
            return Err(TrainingError::invalid_input(format!(
                "epoch {} out of sequence for run {id}, expected {}",
                update.epochs_completed,
                run.epochs_completed + 1
            )));
        }
        if update.epochs_completed > run.epochs_total {
            return Err(TrainingError::invalid_input(format!(
                "epoch {} exceeds epochs_total {}",
                update.epochs_completed, run.epochs_total
            )));
        }
        let reaches_total = update.epochs_completed == run.epochs_total;
        match update.status {
            RunStatus::Running if !reaches_total => {}
            RunStatus::Completed if reaches_total && update.completed_at.is_some() => {}
            other => {
                return Err(TrainingError::invalid_input(format!(
                    "status {other} is not valid after epoch {} of {}",
                    update.epochs_completed, run.epochs_total
                )));
            }
        }
        validate_metrics(update)?;
        run.apply(update);
        Ok(run.clone())
    }

    pub(crate) fn fail(&mut self, id: Uuid, message: &str) -> Result<TrainingRun> {
        let run = self.get_mut(id)?;
        if run.status.is_terminal() {
            return Err(TrainingError::InvalidTransition {
                run_id: id,
                from: run.status,
                to: RunStatus::Failed,
            });
        }
        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.error = Some(message.to_string());
        run.completed_at = Some(now);
        run.updated_at = now;
        Ok(run.clone())
    }

    pub(crate) fn reset(&mut self, id: Uuid) -> Result<TrainingRun> {
        let run = self.get_mut(id)?;
        if run.status.is_terminal() {
            return Err(TrainingError::InvalidTransition {
                run_id: id,
                from: run.status,
                to: RunStatus::Pending,
            });
        }
        run.reset();
        Ok(run.clone())
    }

    pub(crate) fn delete(&mut self, id: Uuid) -> Result<()> {
        self.runs
            .remove(&id)
            .map(|_| ())
            .ok_or(TrainingError::RunNotFound { id })
    }
}

fn validate_metrics(update: &ProgressUpdate) -> Result<()> {
    let m = &update.metrics;
    let accuracies = std::iter::once(m.accuracy).chain(m.val_accuracy);
    let losses = std::iter::once(m.loss).chain(m.val_loss);
    for a in accuracies {
        if !a.is_finite() || !(0.0..=1.0).contains(&a) {
            return Err(TrainingError::invalid_input(format!(
                "accuracy {a} is outside 0.0..=1.0"
            )));
        }
    }
    for l in losses {
        if !l.is_finite() || l < 0.0 {
            return Err(TrainingError::invalid_input(format!("loss {l} is negative")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MetricTable {
    series: HashMap<Uuid, Vec<ModelMetric>>,
}

impl MetricTable {
    pub(crate) fn insert_series(&mut self, run_id: Uuid, points: Vec<ModelMetric>) {
        self.series.insert(run_id, points);
    }

    pub(crate) fn series(&self, run_id: Uuid) -> &[ModelMetric] {
        self.series.get(&run_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn append(&mut self, metric: ModelMetric) -> Result<()> {
        let points = self.series.entry(metric.run_id).or_default();
        let expected = points.last().map_or(1, |m| m.epoch + 1);
        if metric.epoch != expected {
            return Err(TrainingError::invalid_input(format!(
                "epoch {} out of sequence for run {}, expected {expected}",
                metric.epoch, metric.run_id
            )));
        }
        points.push(metric);
        Ok(())
    }

    pub(crate) fn retract(&mut self, run_id: Uuid, epoch: u32) -> Option<ModelMetric> {
        let points = self.series.get_mut(&run_id)?;
        if points.last().map(|m| m.epoch) == Some(epoch) {
            points.pop()
        } else {
            None
        }
    }

    pub(crate) fn remove(&mut self, run_id: Uuid) -> Option<Vec<ModelMetric>> {
        self.series.remove(&run_id)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ModelTable {
    models: HashMap<Uuid, AiModel>,
}

impl ModelTable {
    pub(crate) fn from_models(models: Vec<AiModel>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<AiModel> {
        let mut models: Vec<AiModel> = self.models.values().cloned().collect();
        models.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        models
    }

    pub(crate) fn insert(&mut self, model: AiModel) -> Result<Uuid> {
        if self.models.contains_key(&model.id) {
            return Err(TrainingError::invalid_input(format!(
                "model {} already exists",
                model.id
            )));
        }
        let id = model.id;
        self.models.insert(id, model);
        Ok(id)
    }

    pub(crate) fn get(&self, id: Uuid) -> Result<AiModel> {
        self.models
            .get(&id)
            .cloned()
            .ok_or(TrainingError::ModelNotFound { id })
    }

    pub(crate) fn modify(&mut self, id: Uuid, f: &mut dyn FnMut(&mut AiModel)) -> Result<AiModel> {
        let model = self
            .models
            .get_mut(&id)
            .ok_or(TrainingError::ModelNotFound { id })?;
        f(model);
        model.updated_at = Utc::now();
        Ok(model.clone())
    }
}

/// Run registry held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryRunRegistry {
    table: RwLock<RunTable>,
}

impl InMemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRegistry for InMemoryRunRegistry {
    fn create(&self, run: TrainingRun) -> Result<Uuid> {
        self.table.write().map_err(poisoned)?.create(run)
    }

    fn get(&self, id: Uuid) -> Result<TrainingRun> {
        self.table.read().map_err(poisoned)?.get(id)
    }

    fn list(&self) -> Result<Vec<TrainingRun>> {
        Ok(self.table.read().map_err(poisoned)?.snapshot())
    }

    fn set_status(&self, id: Uuid, from: RunStatus, to: RunStatus) -> Result<TrainingRun> {
        self.table.write().map_err(poisoned)?.set_status(id, from, to)
    }

    fn update_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<TrainingRun> {
        self.table
            .write()
            .map_err(poisoned)?
            .update_progress(id, update)
    }

    fn fail(&self, id: Uuid, message: &str) -> Result<TrainingRun> {
        self.table.write().map_err(poisoned)?.fail(id, message)
    }

    fn reset(&self, id: Uuid) -> Result<TrainingRun> {
        self.table.write().map_err(poisoned)?.reset(id)
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.table.write().map_err(poisoned)?.delete(id)
    }
}

/// Metric series held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetricSeries {
    table: RwLock<MetricTable>,
}

impl InMemoryMetricSeries {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricSeries for InMemoryMetricSeries {
    fn append(&self, metric: ModelMetric) -> Result<()> {
        self.table.write().map_err(poisoned)?.append(metric)
    }

    fn list(&self, run_id: Uuid) -> Result<Vec<ModelMetric>> {
        Ok(self.table.read().map_err(poisoned)?.series(run_id).to_vec())
    }

    fn len(&self, run_id: Uuid) -> Result<usize> {
        Ok(self.table.read().map_err(poisoned)?.series(run_id).len())
    }

    fn retract(&self, run_id: Uuid, epoch: u32) -> Result<bool> {
        Ok(self
            .table
            .write()
            .map_err(poisoned)?
            .retract(run_id, epoch)
            .is_some())
    }

    fn delete_run(&self, run_id: Uuid) -> Result<()> {
        self.table.write().map_err(poisoned)?.remove(run_id);
        Ok(())
    }
}

/// Model store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryModelStore {
    table: RwLock<ModelTable>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for InMemoryModelStore {
    fn insert(&self, model: AiModel) -> Result<Uuid> {
        self.table.write().map_err(poisoned)?.insert(model)
    }

    fn get(&self, id: Uuid) -> Result<AiModel> {
        self.table.read().map_err(poisoned)?.get(id)
    }

    fn list(&self) -> Result<Vec<AiModel>> {
        Ok(self.table.read().map_err(poisoned)?.snapshot())
    }

    fn modify(&self, id: Uuid, f: &mut dyn FnMut(&mut AiModel)) -> Result<AiModel> {
        self.table.write().map_err(poisoned)?.modify(id, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EpochMetrics, NewRun};

    fn pending_run(epochs: u32) -> TrainingRun {
        TrainingRun::new(&NewRun {
            model_id: Uuid::new_v4(),
            dataset_id: None,
            epochs_total: epochs,
            learning_rate: 0.01,
            batch_size: 16,
        })
    }

    fn metrics(accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            accuracy,
            loss: 1.0 - accuracy,
            val_accuracy: Some(accuracy - 0.01),
            val_loss: Some(1.05 - accuracy),
        }
    }

    fn progress(epoch: u32, status: RunStatus) -> ProgressUpdate {
        ProgressUpdate {
            status,
            epochs_completed: epoch,
            metrics: metrics(0.5 + epoch as f64 * 0.01),
            completed_at: (status == RunStatus::Completed).then(Utc::now),
        }
    }

    fn running(registry: &InMemoryRunRegistry, epochs: u32) -> Uuid {
        let id = registry.create(pending_run(epochs)).unwrap();
        registry
            .set_status(id, RunStatus::Pending, RunStatus::Running)
            .unwrap();
        id
    }

    #[test]
    fn test_create_get_delete() {
        let registry = InMemoryRunRegistry::new();
        let run = pending_run(5);
        let id = registry.create(run.clone()).unwrap();
        assert_eq!(registry.get(id).unwrap(), run);
        assert!(registry.create(run).is_err());
        registry.delete(id).unwrap();
        assert!(matches!(
            registry.get(id),
            Err(TrainingError::RunNotFound { .. })
        ));
        assert!(registry.delete(id).is_err());
    }

    #[test]
    fn test_set_status_sets_started_at_once() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 5);
        let started = registry.get(id).unwrap().started_at.unwrap();
        registry
            .set_status(id, RunStatus::Running, RunStatus::Paused)
            .unwrap();
        let resumed = registry
            .set_status(id, RunStatus::Paused, RunStatus::Running)
            .unwrap();
        assert_eq!(resumed.started_at, Some(started));
    }

    #[test]
    fn test_set_status_rejects_wrong_source() {
        let registry = InMemoryRunRegistry::new();
        let id = registry.create(pending_run(5)).unwrap();
        let err = registry
            .set_status(id, RunStatus::Paused, RunStatus::Running)
            .unwrap_err();
        assert!(matches!(
            err,
            TrainingError::InvalidTransition {
                from: RunStatus::Pending,
                ..
            }
        ));
        assert_eq!(registry.get(id).unwrap().status, RunStatus::Pending);
    }

    #[test]
    fn test_set_status_rejects_terminal_target() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 5);
        assert!(
            registry
                .set_status(id, RunStatus::Running, RunStatus::Completed)
                .is_err()
        );
    }

    #[test]
    fn test_update_progress_writes_all_fields() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 3);
        let run = registry
            .update_progress(id, &progress(1, RunStatus::Running))
            .unwrap();
        assert_eq!(run.epochs_completed, 1);
        assert!((run.accuracy.unwrap() - 0.51).abs() < 1e-12);
        assert!(run.val_loss.is_some());
    }

    #[test]
    fn test_update_progress_requires_sequence() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 5);
        assert!(
            registry
                .update_progress(id, &progress(2, RunStatus::Running))
                .is_err()
        );
        registry
            .update_progress(id, &progress(1, RunStatus::Running))
            .unwrap();
        assert!(
            registry
                .update_progress(id, &progress(1, RunStatus::Running))
                .is_err()
        );
        assert_eq!(registry.get(id).unwrap().epochs_completed, 1);
    }

    #[test]
    fn test_update_progress_completion_rules() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 2);
        // Completed before the last epoch is rejected.
        assert!(
            registry
                .update_progress(id, &progress(1, RunStatus::Completed))
                .is_err()
        );
        registry
            .update_progress(id, &progress(1, RunStatus::Running))
            .unwrap();
        // Running on the last epoch is rejected.
        assert!(
            registry
                .update_progress(id, &progress(2, RunStatus::Running))
                .is_err()
        );
        let done = registry
            .update_progress(id, &progress(2, RunStatus::Completed))
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_update_progress_rejected_after_failure() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 5);
        registry.fail(id, "boom").unwrap();
        let err = registry
            .update_progress(id, &progress(1, RunStatus::Running))
            .unwrap_err();
        assert!(matches!(err, TrainingError::InvalidTransition { .. }));
        let run = registry.get(id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.epochs_completed, 0);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(registry.fail(id, "again").is_err());
    }

    #[test]
    fn test_update_progress_rejects_paused_run() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 5);
        registry
            .set_status(id, RunStatus::Running, RunStatus::Paused)
            .unwrap();
        assert!(
            registry
                .update_progress(id, &progress(1, RunStatus::Running))
                .is_err()
        );
    }

    #[test]
    fn test_update_progress_rejects_out_of_range_metrics() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 5);
        let mut update = progress(1, RunStatus::Running);
        update.metrics.accuracy = 1.5;
        assert!(registry.update_progress(id, &update).is_err());
        update.metrics.accuracy = 0.5;
        update.metrics.loss = -0.1;
        assert!(registry.update_progress(id, &update).is_err());
    }

    #[test]
    fn test_reset_clears_progress() {
        let registry = InMemoryRunRegistry::new();
        let id = running(&registry, 5);
        registry
            .update_progress(id, &progress(1, RunStatus::Running))
            .unwrap();
        let run = registry.reset(id).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.epochs_completed, 0);
        assert!(run.accuracy.is_none());
        assert!(run.started_at.is_none());
    }

    #[test]
    fn test_list_filters() {
        let registry = InMemoryRunRegistry::new();
        let a = running(&registry, 5);
        let b = registry.create(pending_run(5)).unwrap();
        let model_of_a = registry.get(a).unwrap().model_id;
        assert_eq!(registry.list().unwrap().len(), 2);
        assert_eq!(registry.list_by_model(model_of_a).unwrap().len(), 1);
        let pending = registry.list_by_status(RunStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
    }

    #[test]
    fn test_metric_series_append_only_in_sequence() {
        let series = InMemoryMetricSeries::new();
        let run_id = Uuid::new_v4();
        series
            .append(ModelMetric::new(run_id, 1, metrics(0.5)))
            .unwrap();
        assert!(
            series
                .append(ModelMetric::new(run_id, 3, metrics(0.6)))
                .is_err()
        );
        series
            .append(ModelMetric::new(run_id, 2, metrics(0.6)))
            .unwrap();
        let epochs: Vec<u32> = series.list(run_id).unwrap().iter().map(|m| m.epoch).collect();
        assert_eq!(epochs, vec![1, 2]);
        assert_eq!(series.len(run_id).unwrap(), 2);
        assert!(series.list(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_metric_series_recent() {
        let series = InMemoryMetricSeries::new();
        let run_id = Uuid::new_v4();
        for epoch in 1..=5 {
            series
                .append(ModelMetric::new(run_id, epoch, metrics(0.5)))
                .unwrap();
        }
        let recent: Vec<u32> = series
            .recent(run_id, 2)
            .unwrap()
            .iter()
            .map(|m| m.epoch)
            .collect();
        assert_eq!(recent, vec![4, 5]);
        assert_eq!(series.recent(run_id, 10).unwrap().len(), 5);
    }

    #[test]
    fn test_metric_series_retract_only_latest() {
        let series = InMemoryMetricSeries::new();
        let run_id = Uuid::new_v4();
        series
            .append(ModelMetric::new(run_id, 1, metrics(0.5)))
            .unwrap();
        series
            .append(ModelMetric::new(run_id, 2, metrics(0.5)))
            .unwrap();
        assert!(!series.retract(run_id, 1).unwrap());
        assert!(series.retract(run_id, 2).unwrap());
        assert_eq!(series.len(run_id).unwrap(), 1);
        series.delete_run(run_id).unwrap();
        assert_eq!(series.len(run_id).unwrap(), 0);
    }

    #[test]
    fn test_model_store_modify() {
        let store = InMemoryModelStore::new();
        let id = store.insert(AiModel::new("resnet")).unwrap();
        let updated = store
            .modify(id, &mut |m: &mut AiModel| m.accuracy = Some(0.9))
            .unwrap();
        assert_eq!(updated.accuracy, Some(0.9));
        assert_eq!(store.get(id).unwrap().accuracy, Some(0.9));
        assert!(matches!(
            store.get(Uuid::new_v4()),
            Err(TrainingError::ModelNotFound { .. })
        ));
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
