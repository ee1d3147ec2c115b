//! # trainsim-core
//!
//! Execution engine for simulated model-training runs. A run advances one
//! epoch per scheduler tick, writing synthetic metrics that clients poll
//! through consistent snapshots, and its model's status and cached metrics
//! follow the run lifecycle.

pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod gateway;
pub mod persistence;
pub mod progression;
pub mod projector;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod types;

pub use auth::{Action, AllowAll, Authorizer, Principal, Role, RolePolicy};
pub use config::{EngineConfig, ReconcilePolicy, load_config};
pub use controller::{ReconcileReport, RunController};
pub use error::{ErrorKind, Result, TrainingError};
pub use events::{EventBus, RunEvent};
pub use progression::{NoiseSource, ProgressionModel, SeededNoise, SyntheticProgression, ZeroNoise};
pub use projector::ModelStatusProjector;
pub use scheduler::{EpochScheduler, TaskExit, TerminalHook};
pub use snapshot::{RunSnapshot, SnapshotReader};
pub use store::{MetricSeries, ModelStore, RunRegistry, Stores};
pub use types::{
    AiModel, EpochMetrics, MetricPoint, ModelMetric, ModelStatus, NewRun, ProgressUpdate,
    RunStatus, RunView, TrainingRun,
};
