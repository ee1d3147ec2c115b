//! Run lifecycle events and the broadcast bus that carries them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted as runs move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    /// A run was created in `pending`.
    Created { run_id: Uuid, model_id: Uuid },
    /// A pending run was started.
    Started { run_id: Uuid },
    /// One epoch was written.
    EpochCompleted {
        run_id: Uuid,
        epoch: u32,
        accuracy: f64,
        loss: f64,
    },
    Paused { run_id: Uuid, epochs_completed: u32 },
    /// A paused run was resumed; the next epoch written is `from_epoch`.
    Resumed { run_id: Uuid, from_epoch: u32 },
    Completed { run_id: Uuid },
    Failed { run_id: Uuid, error: String },
    Deleted { run_id: Uuid },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::Created { run_id, .. }
            | RunEvent::Started { run_id }
            | RunEvent::EpochCompleted { run_id, .. }
            | RunEvent::Paused { run_id, .. }
            | RunEvent::Resumed { run_id, .. }
            | RunEvent::Completed { run_id }
            | RunEvent::Failed { run_id, .. }
            | RunEvent::Deleted { run_id } => *run_id,
        }
    }
}

/// Cloneable sender half of the run event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of receivers it reached; an
    /// event sent with no subscribers is dropped.
    pub fn emit(&self, event: RunEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}
