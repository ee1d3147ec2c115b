//! Epoch scheduler: one background task per active run.
//!
//! Each task waits one tick, computes the next epoch, appends it to the
//! metric series and then writes the run's progress in a single registry
//! call. Cancellation is observed only while the task waits between ticks,
//! so a stop never interrupts an epoch half-written.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, TrainingError};
use crate::events::{EventBus, RunEvent};
use crate::progression::ProgressionModel;
use crate::store::{MetricSeries, RunRegistry, poisoned};
use crate::types::{ModelMetric, ProgressUpdate, RunStatus, TrainingRun};

/// How a scheduler task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// Cancelled between ticks. The run keeps its last written epoch.
    Stopped,
    /// The final epoch was written and the run is `completed`.
    Completed,
    /// A tick failed and the run was forced to `failed`.
    Failed,
}

/// Called once after a task writes a terminal status.
pub trait TerminalHook: Send + Sync {
    fn on_terminal(&self, run: &TrainingRun);
}

struct ActiveTask {
    token: CancellationToken,
    handle: JoinHandle<TaskExit>,
    generation: u64,
}

struct Inner {
    runs: Arc<dyn RunRegistry>,
    metrics: Arc<dyn MetricSeries>,
    model: Arc<dyn ProgressionModel>,
    events: EventBus,
    tick: Duration,
    max_active: usize,
    tasks: Mutex<HashMap<Uuid, ActiveTask>>,
    generation: AtomicU64,
    hook: RwLock<Option<Arc<dyn TerminalHook>>>,
}

/// Owns the background task of every active run.
#[derive(Clone)]
pub struct EpochScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EpochScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochScheduler")
            .field("tick", &self.inner.tick)
            .field("max_active", &self.inner.max_active)
            .field("active", &self.active_count())
            .finish()
    }
}

impl EpochScheduler {
    pub fn new(
        config: &SchedulerConfig,
        runs: Arc<dyn RunRegistry>,
        metrics: Arc<dyn MetricSeries>,
        model: Arc<dyn ProgressionModel>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runs,
                metrics,
                model,
                events,
                tick: config.tick_interval(),
                max_active: config.max_active_runs,
                tasks: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                hook: RwLock::new(None),
            }),
        }
    }

    /// Install the hook invoked after every terminal write.
    pub fn set_terminal_hook(&self, hook: Arc<dyn TerminalHook>) {
        match self.inner.hook.write() {
            Ok(mut slot) => *slot = Some(hook),
            Err(e) => *e.into_inner() = Some(hook),
        }
    }

    /// Spawn the task of a `running` run. It continues at
    /// `epochs_completed + 1`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, run_id: Uuid) -> Result<()> {
        let run = self.inner.runs.get(run_id)?;
        if run.status != RunStatus::Running {
            return Err(TrainingError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Running,
            });
        }

        let mut tasks = self.inner.tasks.lock().map_err(poisoned)?;
        tasks.retain(|_, t| !t.handle.is_finished());
        if tasks.contains_key(&run_id) {
            return Err(TrainingError::AlreadyActive { run_id });
        }
        if tasks.len() >= self.inner.max_active {
            return Err(TrainingError::CapacityExceeded {
                max: self.inner.max_active,
            });
        }

        let token = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(run_task(
            Arc::clone(&self.inner),
            run,
            token.clone(),
            generation,
        ));
        tasks.insert(
            run_id,
            ActiveTask {
                token,
                handle,
                generation,
            },
        );
        debug!(run_id = %run_id, active = tasks.len(), "Scheduler task launched");
        Ok(())
    }

    /// Stop the task of a run and wait until it has terminated.
    ///
    /// Returns `None` when no task was active.
    pub async fn stop(&self, run_id: Uuid) -> Option<TaskExit> {
        let task = match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.remove(&run_id),
            Err(e) => e.into_inner().remove(&run_id),
        }?;
        task.token.cancel();
        let exit = join(&self.inner, run_id, task.handle).await;
        debug!(run_id = %run_id, exit = ?exit, "Scheduler task stopped");
        Some(exit)
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.inner
            .tasks
            .lock()
            .map(|t| t.get(&run_id).is_some_and(|t| !t.handle.is_finished()))
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .map(|t| t.values().filter(|t| !t.handle.is_finished()).count())
            .unwrap_or(0)
    }

    /// Stop every task. Returns how many tasks were stopped.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(Uuid, ActiveTask)> = match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.drain().collect(),
            Err(e) => e.into_inner().drain().collect(),
        };
        for (_, task) in &drained {
            task.token.cancel();
        }
        let count = drained.len();
        for (run_id, task) in drained {
            join(&self.inner, run_id, task.handle).await;
        }
        info!(stopped = count, "Scheduler shut down");
        count
    }
}

/// Await a task handle. A panicked task fails its run.
async fn join(inner: &Arc<Inner>, run_id: Uuid, handle: JoinHandle<TaskExit>) -> TaskExit {
    match handle.await {
        Ok(exit) => exit,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "Scheduler task aborted");
            let epoch = inner
                .runs
                .get(run_id)
                .map(|r| r.next_epoch())
                .unwrap_or_default();
            inner.fail_run(run_id, epoch, format!("scheduler task aborted: {e}"));
            TaskExit::Failed
        }
    }
}

async fn run_task(
    inner: Arc<Inner>,
    mut run: TrainingRun,
    token: CancellationToken,
    generation: u64,
) -> TaskExit {
    let run_id = run.id;
    info!(
        run_id = %run_id,
        from_epoch = run.next_epoch(),
        epochs_total = run.epochs_total,
        "Run progressing"
    );

    let exit = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(run_id = %run_id, epochs_completed = run.epochs_completed, "Cancelled between ticks");
                break TaskExit::Stopped;
            }
            _ = tokio::time::sleep(inner.tick) => {}
        }

        let epoch = run.next_epoch();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| inner.advance(&run, epoch)))
            .unwrap_or_else(|_| Err(TrainingError::storage("epoch computation panicked")));

        match outcome {
            Ok(updated) => {
                run = updated;
                inner.events.emit(RunEvent::EpochCompleted {
                    run_id,
                    epoch,
                    accuracy: run.accuracy.unwrap_or_default(),
                    loss: run.loss.unwrap_or_default(),
                });
                if run.status == RunStatus::Completed {
                    info!(run_id = %run_id, epochs = epoch, "Run completed");
                    inner.events.emit(RunEvent::Completed { run_id });
                    inner.terminal(&run);
                    break TaskExit::Completed;
                }
            }
            Err(e) => {
                inner.fail_run(run_id, epoch, e.to_string());
                break TaskExit::Failed;
            }
        }
    };

    if exit != TaskExit::Stopped {
        inner.release(run_id, generation);
    }
    exit
}

impl Inner {
    /// Compute, append and record one epoch.
    fn advance(&self, run: &TrainingRun, epoch: u32) -> Result<TrainingRun> {
        let metrics = self.model.compute(run, epoch)?;
        self.metrics
            .append(ModelMetric::new(run.id, epoch, metrics))?;

        let done = epoch >= run.epochs_total;
        let update = ProgressUpdate {
            status: if done {
                RunStatus::Completed
            } else {
                RunStatus::Running
            },
            epochs_completed: epoch,
            metrics,
            completed_at: done.then(Utc::now),
        };
        match self.runs.update_progress(run.id, &update) {
            Ok(updated) => {
                debug!(run_id = %run.id, epoch, accuracy = metrics.accuracy, loss = metrics.loss, "Epoch written");
                Ok(updated)
            }
            Err(e) => {
                if let Err(retract_err) = self.metrics.retract(run.id, epoch) {
                    error!(run_id = %run.id, epoch, error = %retract_err, "Failed to retract metric");
                }
                Err(e)
            }
        }
    }

    /// Force a run to `failed` after a fault and fire the terminal hook.
    fn fail_run(&self, run_id: Uuid, epoch: u32, message: String) {
        let fault = TrainingError::SchedulerFault {
            run_id,
            epoch,
            message,
        };
        error!(run_id = %run_id, epoch, error = %fault, "Scheduler fault");
        match self.runs.fail(run_id, &fault.to_string()) {
            Ok(run) => {
                self.events.emit(RunEvent::Failed {
                    run_id,
                    error: fault.to_string(),
                });
                self.terminal(&run);
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "Could not mark run failed"),
        }
    }

    fn terminal(&self, run: &TrainingRun) {
        let hook = match self.hook.read() {
            Ok(slot) => slot.clone(),
            Err(e) => e.into_inner().clone(),
        };
        if let Some(hook) = hook {
            hook.on_terminal(run);
        }
    }

    /// Drop a finished task's own table entry unless a newer task owns it.
    fn release(&self, run_id: Uuid, generation: u64) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if tasks.get(&run_id).is_some_and(|t| t.generation == generation) {
                tasks.remove(&run_id);
            }
        }
    }
}
