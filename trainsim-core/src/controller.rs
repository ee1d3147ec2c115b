//! Run controller: the business-rule layer over the scheduler and stores.
//!
//! Every operation checks the [`Authorizer`] first, then validates the run's
//! current status before touching the scheduler. Control operations on one
//! run are serialized by a per-run async lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{Action, Authorizer, Principal};
use crate::config::{EngineConfig, ReconcilePolicy};
use crate::error::{Result, TrainingError};
use crate::events::{EventBus, RunEvent};
use crate::progression::{ProgressionModel, SyntheticProgression};
use crate::projector::ModelStatusProjector;
use crate::scheduler::{EpochScheduler, TaskExit, TerminalHook};
use crate::snapshot::{RunSnapshot, SnapshotReader};
use crate::store::Stores;
use crate::types::{AiModel, MetricPoint, NewRun, RunStatus, RunView, TrainingRun};

/// Error message recorded on runs failed by restart reconciliation.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Runs touched by [`RunController::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub failed: Vec<Uuid>,
    pub paused: Vec<Uuid>,
    pub reset: Vec<Uuid>,
    /// Metric points dropped because the registry never acknowledged them.
    pub retracted_points: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
            && self.paused.is_empty()
            && self.reset.is_empty()
            && self.retracted_points == 0
    }
}

/// Fires the model projection once per run.
struct ProjectionHook {
    projector: Arc<ModelStatusProjector>,
    fired: Mutex<HashSet<Uuid>>,
}

impl ProjectionHook {
    fn forget(&self, run_id: Uuid) {
        if let Ok(mut fired) = self.fired.lock() {
            fired.remove(&run_id);
        }
    }
}

impl TerminalHook for ProjectionHook {
    fn on_terminal(&self, run: &TrainingRun) {
        let first = match self.fired.lock() {
            Ok(mut fired) => fired.insert(run.id),
            Err(e) => e.into_inner().insert(run.id),
        };
        if !first {
            return;
        }
        if let Err(e) = self.projector.on_terminal(run) {
            warn!(run_id = %run.id, model_id = %run.model_id, error = %e, "Model projection failed");
        }
    }
}

/// Entry point for creating and controlling training runs.
pub struct RunController {
    stores: Stores,
    scheduler: EpochScheduler,
    projector: Arc<ModelStatusProjector>,
    hook: Arc<ProjectionHook>,
    reader: SnapshotReader,
    authorizer: Arc<dyn Authorizer>,
    events: EventBus,
    max_epochs: u32,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("scheduler", &self.scheduler)
            .field("max_epochs", &self.max_epochs)
            .finish()
    }
}

impl RunController {
    /// Build a controller with the default seeded progression model.
    pub fn new(config: &EngineConfig, stores: Stores, authorizer: Arc<dyn Authorizer>) -> Self {
        let model = Arc::new(SyntheticProgression::seeded(config.progression.clone()));
        Self::with_progression(config, stores, authorizer, model)
    }

    pub fn with_progression(
        config: &EngineConfig,
        stores: Stores,
        authorizer: Arc<dyn Authorizer>,
        model: Arc<dyn ProgressionModel>,
    ) -> Self {
        let events = EventBus::new(config.scheduler.event_capacity);
        let scheduler = EpochScheduler::new(
            &config.scheduler,
            stores.runs.clone(),
            stores.metrics.clone(),
            model,
            events.clone(),
        );
        let projector = Arc::new(ModelStatusProjector::new(
            stores.runs.clone(),
            stores.models.clone(),
            &config.progression,
        ));
        let hook = Arc::new(ProjectionHook {
            projector: projector.clone(),
            fired: Mutex::new(HashSet::new()),
        });
        scheduler.set_terminal_hook(hook.clone());
        let reader = SnapshotReader::new(stores.runs.clone(), stores.metrics.clone());
        Self {
            stores,
            scheduler,
            projector,
            hook,
            reader,
            authorizer,
            events,
            max_epochs: config.scheduler.max_epochs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &EpochScheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    // --- models ---

    pub fn register_model(&self, principal: &Principal, name: &str) -> Result<AiModel> {
        self.authorize(principal, Action::CreateRun)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(TrainingError::invalid_input("model name must not be empty"));
        }
        let model = AiModel::new(name);
        self.stores.models.insert(model.clone())?;
        info!(model_id = %model.id, name = %model.name, "Model registered");
        Ok(model)
    }

    pub fn get_model(&self, principal: &Principal, id: Uuid) -> Result<AiModel> {
        self.authorize(principal, Action::ReadRun)?;
        self.stores.models.get(id)
    }

    pub fn list_models(&self, principal: &Principal) -> Result<Vec<AiModel>> {
        self.authorize(principal, Action::ReadRun)?;
        self.stores.models.list()
    }

    // --- run lifecycle ---

    pub fn create_run(&self, principal: &Principal, params: NewRun) -> Result<TrainingRun> {
        self.authorize(principal, Action::CreateRun)?;
        if params.epochs_total == 0 || params.epochs_total > self.max_epochs {
            return Err(TrainingError::invalid_input(format!(
                "epochs_total must be in 1..={}, got {}",
                self.max_epochs, params.epochs_total
            )));
        }
        if !params.learning_rate.is_finite() || params.learning_rate <= 0.0 {
            return Err(TrainingError::invalid_input(format!(
                "learning_rate must be a positive number, got {}",
                params.learning_rate
            )));
        }
        if params.batch_size == 0 {
            return Err(TrainingError::invalid_input("batch_size must be at least 1"));
        }
        self.stores.models.get(params.model_id)?;

        let run = TrainingRun::new(&params);
        self.stores.runs.create(run.clone())?;
        info!(
            run_id = %run.id,
            model_id = %run.model_id,
            epochs_total = run.epochs_total,
            learning_rate = run.learning_rate(),
            batch_size = run.batch_size(),
            principal = %principal.id,
            "Run created"
        );
        self.events.emit(RunEvent::Created {
            run_id: run.id,
            model_id: run.model_id,
        });
        Ok(run)
    }

    pub async fn start_run(&self, principal: &Principal, id: Uuid) -> Result<TrainingRun> {
        self.authorize(principal, Action::StartRun)?;
        let _guard = self.run_lock(id).lock_owned().await;

        let run = self.stores.runs.get(id)?;
        if run.status != RunStatus::Pending {
            return Err(TrainingError::InvalidTransition {
                run_id: id,
                from: run.status,
                to: RunStatus::Running,
            });
        }
        let running = self
            .stores
            .runs
            .set_status(id, RunStatus::Pending, RunStatus::Running)?;
        self.mark_training(&running);
        if let Err(e) = self.scheduler.launch(id) {
            if let Err(revert) = self.stores.runs.reset(id) {
                warn!(run_id = %id, error = %revert, "Failed to revert run to pending");
            }
            self.unmark_training(&running);
            return Err(e);
        }
        info!(run_id = %id, principal = %principal.id, "Run started");
        self.events.emit(RunEvent::Started { run_id: id });
        Ok(running)
    }

    pub async fn pause_run(&self, principal: &Principal, id: Uuid) -> Result<TrainingRun> {
        self.authorize(principal, Action::PauseRun)?;
        let _guard = self.run_lock(id).lock_owned().await;

        let run = self.stores.runs.get(id)?;
        if run.status != RunStatus::Running {
            return Err(TrainingError::InvalidTransition {
                run_id: id,
                from: run.status,
                to: RunStatus::Paused,
            });
        }
        match self.scheduler.stop(id).await {
            Some(TaskExit::Stopped) | None => {}
            Some(TaskExit::Completed | TaskExit::Failed) => {
                // The run reached a terminal status while we were stopping it.
                let current = self.stores.runs.get(id)?;
                return Err(TrainingError::InvalidTransition {
                    run_id: id,
                    from: current.status,
                    to: RunStatus::Paused,
                });
            }
        }
        let paused = self
            .stores
            .runs
            .set_status(id, RunStatus::Running, RunStatus::Paused)?;
        info!(run_id = %id, epochs_completed = paused.epochs_completed, "Run paused");
        self.events.emit(RunEvent::Paused {
            run_id: id,
            epochs_completed: paused.epochs_completed,
        });
        Ok(paused)
    }

    pub async fn resume_run(&self, principal: &Principal, id: Uuid) -> Result<TrainingRun> {
        self.authorize(principal, Action::ResumeRun)?;
        let _guard = self.run_lock(id).lock_owned().await;

        let run = self.stores.runs.get(id)?;
        if run.status != RunStatus::Paused {
            return Err(TrainingError::InvalidTransition {
                run_id: id,
                from: run.status,
                to: RunStatus::Running,
            });
        }
        let running = self
            .stores
            .runs
            .set_status(id, RunStatus::Paused, RunStatus::Running)?;
        self.mark_training(&running);
        if let Err(e) = self.scheduler.launch(id) {
            if let Err(revert) = self
                .stores
                .runs
                .set_status(id, RunStatus::Running, RunStatus::Paused)
            {
                warn!(run_id = %id, error = %revert, "Failed to revert run to paused");
            }
            self.unmark_training(&running);
            return Err(e);
        }
        info!(run_id = %id, from_epoch = running.next_epoch(), "Run resumed");
        self.events.emit(RunEvent::Resumed {
            run_id: id,
            from_epoch: running.next_epoch(),
        });
        Ok(running)
    }

    /// Stop the run's scheduler, then delete its metrics and record.
    pub async fn delete_run(&self, principal: &Principal, id: Uuid) -> Result<()> {
        self.authorize(principal, Action::DeleteRun)?;
        let lock = self.run_lock(id);
        let _guard = lock.lock_owned().await;

        let run = self.stores.runs.get(id)?;
        if let Some(exit) = self.scheduler.stop(id).await {
            info!(run_id = %id, exit = ?exit, "Stopped scheduler before delete");
        }
        self.stores.metrics.delete_run(id)?;
        self.stores.runs.delete(id)?;
        if let Err(e) = self.projector.on_stopped(run.model_id, id) {
            warn!(run_id = %id, model_id = %run.model_id, error = %e, "Model projection failed");
        }
        self.hook.forget(id);
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&id);
        }
        info!(run_id = %id, principal = %principal.id, "Run deleted");
        self.events.emit(RunEvent::Deleted { run_id: id });
        Ok(())
    }

    // --- reads ---

    pub fn get_run(&self, principal: &Principal, id: Uuid) -> Result<RunView> {
        self.authorize(principal, Action::ReadRun)?;
        self.reader.fetch_run(id)
    }

    pub fn list_runs(&self, principal: &Principal) -> Result<Vec<RunView>> {
        self.authorize(principal, Action::ReadRun)?;
        Ok(self
            .stores
            .runs
            .list()?
            .iter()
            .map(RunView::from)
            .collect())
    }

    pub fn get_metrics(&self, principal: &Principal, id: Uuid) -> Result<Vec<MetricPoint>> {
        self.authorize(principal, Action::ReadRun)?;
        self.reader.fetch_metrics(id)
    }

    /// Run plus metrics, optionally limited to the last `recent` points.
    pub fn snapshot(
        &self,
        principal: &Principal,
        id: Uuid,
        recent: Option<usize>,
    ) -> Result<RunSnapshot> {
        self.authorize(principal, Action::ReadRun)?;
        match recent {
            Some(limit) => self.reader.assemble_recent(id, limit),
            None => self.reader.assemble_snapshot(id),
        }
    }

    // --- recovery ---

    /// Settle runs whose scheduler did not survive a restart.
    ///
    /// Trailing metric points beyond `epochs_completed` are retracted for
    /// every run; `running` runs without a live task are then handled by
    /// `policy`.
    pub async fn reconcile(&self, policy: ReconcilePolicy) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for run in self.stores.runs.list()? {
            let _guard = self.run_lock(run.id).lock_owned().await;
            report.retracted_points += self.retract_unacknowledged(&run)?;

            if run.status != RunStatus::Running || self.scheduler.is_active(run.id) {
                continue;
            }
            match policy {
                ReconcilePolicy::Fail => {
                    let failed = self.stores.runs.fail(run.id, INTERRUPTED_BY_RESTART)?;
                    self.events.emit(RunEvent::Failed {
                        run_id: run.id,
                        error: INTERRUPTED_BY_RESTART.to_string(),
                    });
                    self.hook.on_terminal(&failed);
                    report.failed.push(run.id);
                }
                ReconcilePolicy::Pause => {
                    let paused =
                        self.stores
                            .runs
                            .set_status(run.id, RunStatus::Running, RunStatus::Paused)?;
                    self.events.emit(RunEvent::Paused {
                        run_id: run.id,
                        epochs_completed: paused.epochs_completed,
                    });
                    report.paused.push(run.id);
                }
                ReconcilePolicy::Reset => {
                    self.stores.metrics.delete_run(run.id)?;
                    self.stores.runs.reset(run.id)?;
                    if let Err(e) = self.projector.on_stopped(run.model_id, run.id) {
                        warn!(run_id = %run.id, error = %e, "Model projection failed");
                    }
                    report.reset.push(run.id);
                }
            }
            warn!(run_id = %run.id, policy = %policy, "Reconciled interrupted run");
        }
        info!(
            failed = report.failed.len(),
            paused = report.paused.len(),
            reset = report.reset.len(),
            retracted = report.retracted_points,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Stop every scheduler task.
    pub async fn shutdown(&self) -> usize {
        self.scheduler.shutdown().await
    }

    fn retract_unacknowledged(&self, run: &TrainingRun) -> Result<usize> {
        let points = self.stores.metrics.list(run.id)?;
        let mut retracted = 0;
        for point in points.iter().rev() {
            if point.epoch <= run.epochs_completed {
                break;
            }
            if self.stores.metrics.retract(run.id, point.epoch)? {
                retracted += 1;
            }
        }
        if retracted > 0 {
            warn!(run_id = %run.id, retracted, "Dropped unacknowledged metric points");
        }
        Ok(retracted)
    }

    /// Must run before the scheduler task exists, so the task's terminal
    /// projection always comes after it.
    fn mark_training(&self, run: &TrainingRun) {
        if let Err(e) = self.projector.on_training_started(run.model_id) {
            warn!(run_id = %run.id, model_id = %run.model_id, error = %e, "Model projection failed");
        }
    }

    fn unmark_training(&self, run: &TrainingRun) {
        if let Err(e) = self.projector.on_stopped(run.model_id, run.id) {
            warn!(run_id = %run.id, model_id = %run.model_id, error = %e, "Model projection failed");
        }
    }

    fn authorize(&self, principal: &Principal, action: Action) -> Result<()> {
        if self.authorizer.has_permission(principal, action) {
            return Ok(());
        }
        warn!(principal = %principal.id, role = %principal.role, action = %action, "Permission denied");
        Err(TrainingError::PermissionDenied {
            principal: principal.id.clone(),
            action: action.to_string(),
        })
    }

    fn run_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        locks.entry(id).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, Role, RolePolicy};
    use crate::error::ErrorKind;
    use crate::types::ModelStatus;

    fn controller(authorizer: Arc<dyn Authorizer>) -> RunController {
        let mut config = EngineConfig::default();
        config.scheduler.max_epochs = 100;
        RunController::new(&config, Stores::in_memory(), authorizer)
    }

    fn admin() -> Principal {
        Principal::new("alice", Role::Admin)
    }

    fn params(model_id: Uuid, epochs: u32) -> NewRun {
        NewRun {
            model_id,
            dataset_id: None,
            epochs_total: epochs,
            learning_rate: 0.001,
            batch_size: 32,
        }
    }

    #[test]
    fn test_create_run_validation() {
        let c = controller(Arc::new(AllowAll));
        let model = c.register_model(&admin(), "mlp").unwrap();

        let bad = [
            params(model.id, 0),
            params(model.id, 101),
            NewRun {
                learning_rate: 0.0,
                ..params(model.id, 10)
            },
            NewRun {
                learning_rate: f64::NAN,
                ..params(model.id, 10)
            },
            NewRun {
                batch_size: 0,
                ..params(model.id, 10)
            },
        ];
        for p in bad {
            let err = c.create_run(&admin(), p).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
        }
        let err = c.create_run(&admin(), params(Uuid::new_v4(), 10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(c.list_runs(&admin()).unwrap().is_empty());

        let run = c.create_run(&admin(), params(model.id, 100)).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.epochs_completed, 0);
    }

    #[test]
    fn test_register_model_rejects_blank_name() {
        let c = controller(Arc::new(AllowAll));
        assert!(c.register_model(&admin(), "  ").is_err());
        let model = c.register_model(&admin(), " vit ").unwrap();
        assert_eq!(model.name, "vit");
        assert_eq!(model.status, ModelStatus::Created);
    }

    #[tokio::test]
    async fn test_viewer_cannot_mutate() {
        let c = controller(Arc::new(RolePolicy));
        let model = c.register_model(&admin(), "cnn").unwrap();
        let run = c.create_run(&admin(), params(model.id, 5)).unwrap();
        let viewer = Principal::new("victor", Role::Viewer);

        let err = c.start_run(&viewer, run.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(c.create_run(&viewer, params(model.id, 5)).is_err());
        assert!(c.delete_run(&viewer, run.id).await.is_err());
        assert!(c.register_model(&viewer, "x").is_err());

        assert_eq!(c.get_run(&viewer, run.id).unwrap().status, RunStatus::Pending);
        assert!(c.get_metrics(&viewer, run.id).unwrap().is_empty());
        assert_eq!(c.list_models(&viewer).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transitions_leave_state_unchanged() {
        let c = controller(Arc::new(AllowAll));
        let model = c.register_model(&admin(), "gpt").unwrap();
        let run = c.create_run(&admin(), params(model.id, 5)).unwrap();

        for result in [
            c.pause_run(&admin(), run.id).await,
            c.resume_run(&admin(), run.id).await,
        ] {
            assert!(matches!(
                result,
                Err(TrainingError::InvalidTransition {
                    from: RunStatus::Pending,
                    ..
                })
            ));
        }
        assert_eq!(
            c.get_run(&admin(), run.id).unwrap().status,
            RunStatus::Pending
        );
        assert!(matches!(
            c.start_run(&admin(), Uuid::new_v4()).await,
            Err(TrainingError::RunNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_start_reverts_model_and_run() {
        let mut config = EngineConfig::default();
        config.scheduler.max_active_runs = 1;
        let c = RunController::new(&config, Stores::in_memory(), Arc::new(AllowAll));
        let busy = c.register_model(&admin(), "busy").unwrap();
        let idle = c.register_model(&admin(), "idle").unwrap();
        let first = c.create_run(&admin(), params(busy.id, 50)).unwrap();
        let second = c.create_run(&admin(), params(idle.id, 50)).unwrap();
        c.start_run(&admin(), first.id).await.unwrap();

        let err = c.start_run(&admin(), second.id).await.unwrap_err();
        assert!(matches!(err, TrainingError::CapacityExceeded { max: 1 }));
        assert_eq!(c.get_run(&admin(), second.id).unwrap().status, RunStatus::Pending);
        assert_eq!(c.get_model(&admin(), idle.id).unwrap().status, ModelStatus::Created);
        assert_eq!(c.get_model(&admin(), busy.id).unwrap().status, ModelStatus::Training);
        c.shutdown().await;
    }

    #[test]
    fn test_reconcile_report_is_empty() {
        assert!(ReconcileReport::default().is_empty());
        let report = ReconcileReport {
            retracted_points: 1,
            ..ReconcileReport::default()
        };
        assert!(!report.is_empty());
    }
}
