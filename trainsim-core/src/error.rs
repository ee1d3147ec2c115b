//! Error types for the trainsim engine.
//!
//! Uses `thiserror` for a single public error enum. Variants are grouped by
//! [`ErrorKind`] so callers (and the gateway) can react to the class of a
//! failure without matching every variant.

use uuid::Uuid;

use crate::types::RunStatus;

/// Coarse classification of a [`TrainingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Illegal transition or bad input. State is unchanged.
    Validation,
    /// Unknown run or model id. State is unchanged.
    NotFound,
    /// The authorizer refused the action. State is unchanged.
    PermissionDenied,
    /// A background tick failed and the run was forced to `failed`.
    SchedulerFault,
    /// Persistence or serialization failure.
    Storage,
}

/// Top-level error type for the training-run engine.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Run {run_id} already has an active scheduler")]
    AlreadyActive { run_id: Uuid },

    #[error("Maximum active runs ({max}) reached")]
    CapacityExceeded { max: usize },

    #[error("Run not found: {id}")]
    RunNotFound { id: Uuid },

    #[error("Model not found: {id}")]
    ModelNotFound { id: Uuid },

    #[error("Permission denied for principal '{principal}': {action}")]
    PermissionDenied { principal: String, action: String },

    #[error("Scheduler fault on run {run_id} at epoch {epoch}: {message}")]
    SchedulerFault {
        run_id: Uuid,
        epoch: u32,
        message: String,
    },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrainingError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. }
            | Self::InvalidInput { .. }
            | Self::AlreadyActive { .. }
            | Self::CapacityExceeded { .. } => ErrorKind::Validation,
            Self::RunNotFound { .. } | Self::ModelNotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::SchedulerFault { .. } => ErrorKind::SchedulerFault,
            Self::Storage { .. } | Self::Io(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller may retry the same request after correcting it.
    ///
    /// Scheduler faults are terminal for their run and never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::PermissionDenied
        )
    }
}

/// A type alias for results using [`TrainingError`].
pub type Result<T> = std::result::Result<T, TrainingError>;
