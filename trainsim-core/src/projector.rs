//! Derives a model's status and cached metrics from its runs.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::config::ProgressionConfig;
use crate::error::Result;
use crate::store::{ModelStore, RunRegistry};
use crate::types::{AiModel, ModelStatus, RunStatus, TrainingRun};

/// Keeps `AiModel` records in step with run lifecycle transitions.
///
/// A model counts as training while any of its runs is `running` or
/// `paused`. Deployment status is never changed here.
pub struct ModelStatusProjector {
    runs: Arc<dyn RunRegistry>,
    models: Arc<dyn ModelStore>,
    base_latency_ms: f64,
    latency_per_sample_ms: f64,
}

impl ModelStatusProjector {
    pub fn new(
        runs: Arc<dyn RunRegistry>,
        models: Arc<dyn ModelStore>,
        progression: &ProgressionConfig,
    ) -> Self {
        Self {
            runs,
            models,
            base_latency_ms: progression.base_latency_ms,
            latency_per_sample_ms: progression.latency_per_sample_ms,
        }
    }

    /// A run of the model started or resumed.
    pub fn on_training_started(&self, model_id: Uuid) -> Result<AiModel> {
        self.models.modify(model_id, &mut |m: &mut AiModel| {
            if m.status != ModelStatus::Deployed {
                m.status = ModelStatus::Training;
            }
        })
    }

    /// A run completed: cache its final metrics on the model.
    pub fn on_completed(&self, run: &TrainingRun) -> Result<AiModel> {
        let accuracy = run.val_accuracy.or(run.accuracy);
        let latency =
            self.base_latency_ms + f64::from(run.batch_size()) * self.latency_per_sample_ms;
        let model = self.settle(run.model_id, run.id, &mut |m: &mut AiModel| {
            if let Some(acc) = accuracy {
                m.accuracy = Some(acc);
                m.error_rate = Some(1.0 - acc);
            }
            m.latency_ms = Some(latency);
        })?;
        debug!(model_id = %model.id, run_id = %run.id, status = %model.status, "Projected completion");
        Ok(model)
    }

    /// A run failed or was deleted: clear the training flag if nothing
    /// else is training the model.
    pub fn on_stopped(&self, model_id: Uuid, run_id: Uuid) -> Result<AiModel> {
        self.settle(model_id, run_id, &mut |_: &mut AiModel| {})
    }

    /// Dispatch on the terminal status of a run.
    pub fn on_terminal(&self, run: &TrainingRun) -> Result<AiModel> {
        match run.status {
            RunStatus::Completed => self.on_completed(run),
            _ => self.on_stopped(run.model_id, run.id),
        }
    }

    /// Apply `update`, then move `training` back to `created` unless
    /// another run of the model is active.
    ///
    /// The registry scan runs inside the model store's write, so it is
    /// ordered against every `on_training_started` of the same model.
    fn settle(
        &self,
        model_id: Uuid,
        run_id: Uuid,
        update: &mut dyn FnMut(&mut AiModel),
    ) -> Result<AiModel> {
        let mut scan: Result<()> = Ok(());
        let model = self.models.modify(model_id, &mut |m: &mut AiModel| {
            update(m);
            if m.status != ModelStatus::Training {
                return;
            }
            match self.other_active(model_id, run_id) {
                Ok(false) => m.status = ModelStatus::Created,
                Ok(true) => {}
                Err(e) => scan = Err(e),
            }
        })?;
        scan?;
        Ok(model)
    }

    fn other_active(&self, model_id: Uuid, run_id: Uuid) -> Result<bool> {
        Ok(self.runs.list_by_model(model_id)?.iter().any(|r| {
            r.id != run_id && matches!(r.status, RunStatus::Running | RunStatus::Paused)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryModelStore, InMemoryRunRegistry};
    use crate::types::{EpochMetrics, NewRun, ProgressUpdate};

    struct Fixture {
        runs: Arc<InMemoryRunRegistry>,
        models: Arc<InMemoryModelStore>,
        projector: ModelStatusProjector,
        model_id: Uuid,
    }

    fn fixture() -> Fixture {
        let runs = Arc::new(InMemoryRunRegistry::new());
        let models = Arc::new(InMemoryModelStore::new());
        let model_id = models.insert(AiModel::new("resnet")).unwrap();
        let projector =
            ModelStatusProjector::new(runs.clone(), models.clone(), &ProgressionConfig::default());
        Fixture {
            runs,
            models,
            projector,
            model_id,
        }
    }

    fn run_with_status(f: &Fixture, epochs: u32, status: RunStatus) -> TrainingRun {
        let run = TrainingRun::new(&NewRun {
            model_id: f.model_id,
            dataset_id: None,
            epochs_total: epochs,
            learning_rate: 0.001,
            batch_size: 32,
        });
        let id = f.runs.create(run).unwrap();
        if status == RunStatus::Pending {
            return f.runs.get(id).unwrap();
        }
        f.runs
            .set_status(id, RunStatus::Pending, RunStatus::Running)
            .unwrap();
        match status {
            RunStatus::Running => f.runs.get(id).unwrap(),
            RunStatus::Paused => f
                .runs
                .set_status(id, RunStatus::Running, RunStatus::Paused)
                .unwrap(),
            RunStatus::Failed => f.runs.fail(id, "boom").unwrap(),
            RunStatus::Completed => {
                let mut last = f.runs.get(id).unwrap();
                for epoch in 1..=epochs {
                    let done = epoch == epochs;
                    last = f
                        .runs
                        .update_progress(
                            id,
                            &ProgressUpdate {
                                status: if done {
                                    RunStatus::Completed
                                } else {
                                    RunStatus::Running
                                },
                                epochs_completed: epoch,
                                metrics: EpochMetrics {
                                    accuracy: 0.9,
                                    loss: 0.2,
                                    val_accuracy: Some(0.88),
                                    val_loss: Some(0.25),
                                },
                                completed_at: done.then(chrono::Utc::now),
                            },
                        )
                        .unwrap();
                }
                last
            }
            RunStatus::Pending => unreachable!(),
        }
    }

    #[test]
    fn test_start_marks_training_unless_deployed() {
        let f = fixture();
        let model = f.projector.on_training_started(f.model_id).unwrap();
        assert_eq!(model.status, ModelStatus::Training);

        f.models
            .modify(f.model_id, &mut |m: &mut AiModel| {
                m.status = ModelStatus::Deployed
            })
            .unwrap();
        let model = f.projector.on_training_started(f.model_id).unwrap();
        assert_eq!(model.status, ModelStatus::Deployed);
    }

    #[test]
    fn test_completion_writes_metrics_and_clears_training() {
        let f = fixture();
        f.projector.on_training_started(f.model_id).unwrap();
        let run = run_with_status(&f, 3, RunStatus::Completed);

        let model = f.projector.on_terminal(&run).unwrap();
        assert_eq!(model.status, ModelStatus::Created);
        assert_eq!(model.accuracy, Some(0.88));
        assert!((model.error_rate.unwrap() - 0.12).abs() < 1e-9);
        assert_eq!(model.latency_ms, Some(12.0 + 32.0 * 0.25));
    }

    #[test]
    fn test_completion_keeps_training_while_other_run_active() {
        let f = fixture();
        f.projector.on_training_started(f.model_id).unwrap();
        run_with_status(&f, 5, RunStatus::Paused);
        let run = run_with_status(&f, 2, RunStatus::Completed);

        let model = f.projector.on_completed(&run).unwrap();
        assert_eq!(model.status, ModelStatus::Training);
        assert_eq!(model.accuracy, Some(0.88));
    }

    #[test]
    fn test_completion_leaves_deployment_untouched() {
        let f = fixture();
        let deployed_at = chrono::Utc::now();
        f.models
            .modify(f.model_id, &mut |m: &mut AiModel| {
                m.status = ModelStatus::Deployed;
                m.deployed_at = Some(deployed_at);
            })
            .unwrap();
        let run = run_with_status(&f, 1, RunStatus::Completed);
        let model = f.projector.on_completed(&run).unwrap();
        assert_eq!(model.status, ModelStatus::Deployed);
        assert_eq!(model.deployed_at, Some(deployed_at));
        assert_eq!(model.accuracy, Some(0.88));
    }

    #[test]
    fn test_failure_reverts_training() {
        let f = fixture();
        f.projector.on_training_started(f.model_id).unwrap();
        let run = run_with_status(&f, 4, RunStatus::Failed);
        let model = f.projector.on_terminal(&run).unwrap();
        assert_eq!(model.status, ModelStatus::Created);
        assert!(model.accuracy.is_none());
    }

    #[test]
    fn test_stop_ignores_the_stopped_run_itself() {
        let f = fixture();
        f.projector.on_training_started(f.model_id).unwrap();
        let running = run_with_status(&f, 4, RunStatus::Running);
        let model = f.projector.on_stopped(f.model_id, running.id).unwrap();
        assert_eq!(model.status, ModelStatus::Created);
    }

    /// Registry whose first scan lets another run start and mark the model
    /// training on a second thread before the scan result is used.
    struct StartDuringScan {
        inner: Arc<InMemoryRunRegistry>,
        models: Arc<InMemoryModelStore>,
        model_id: Uuid,
        other: Uuid,
        started: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
    }

    impl RunRegistry for StartDuringScan {
        fn create(&self, run: TrainingRun) -> Result<Uuid> {
            self.inner.create(run)
        }
        fn get(&self, id: Uuid) -> Result<TrainingRun> {
            self.inner.get(id)
        }
        fn list(&self) -> Result<Vec<TrainingRun>> {
            let runs = self.inner.list()?;
            let mut started = self.started.lock().unwrap();
            if started.is_none() {
                let (runs, models) = (self.inner.clone(), self.models.clone());
                let (model_id, other) = (self.model_id, self.other);
                *started = Some(std::thread::spawn(move || {
                    runs.set_status(other, RunStatus::Pending, RunStatus::Running)
                        .unwrap();
                    models
                        .modify(model_id, &mut |m: &mut AiModel| {
                            m.status = ModelStatus::Training
                        })
                        .unwrap();
                }));
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Ok(runs)
        }
        fn set_status(&self, id: Uuid, from: RunStatus, to: RunStatus) -> Result<TrainingRun> {
            self.inner.set_status(id, from, to)
        }
        fn update_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<TrainingRun> {
            self.inner.update_progress(id, update)
        }
        fn fail(&self, id: Uuid, message: &str) -> Result<TrainingRun> {
            self.inner.fail(id, message)
        }
        fn reset(&self, id: Uuid) -> Result<TrainingRun> {
            self.inner.reset(id)
        }
        fn delete(&self, id: Uuid) -> Result<()> {
            self.inner.delete(id)
        }
    }

    #[test]
    fn test_failure_keeps_training_for_run_started_concurrently() {
        let f = fixture();
        f.projector.on_training_started(f.model_id).unwrap();
        let failed = run_with_status(&f, 4, RunStatus::Failed);
        let other = run_with_status(&f, 4, RunStatus::Pending);

        let registry = Arc::new(StartDuringScan {
            inner: f.runs.clone(),
            models: f.models.clone(),
            model_id: f.model_id,
            other: other.id,
            started: std::sync::Mutex::new(None),
        });
        let projector = ModelStatusProjector::new(
            registry.clone(),
            f.models.clone(),
            &ProgressionConfig::default(),
        );
        projector.on_terminal(&failed).unwrap();
        registry.started.lock().unwrap().take().unwrap().join().unwrap();

        assert_eq!(f.runs.get(other.id).unwrap().status, RunStatus::Running);
        assert_eq!(f.models.get(f.model_id).unwrap().status, ModelStatus::Training);
    }

    #[test]
    fn test_unknown_model() {
        let f = fixture();
        assert!(f.projector.on_training_started(Uuid::new_v4()).is_err());
    }
}
