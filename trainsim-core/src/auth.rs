//! Authorization of run control operations.

use serde::{Deserialize, Serialize};

/// Role of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Engineer,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Engineer => write!(f, "engineer"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// The caller of a controller operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// The in-process operator used by the CLI and by reconciliation.
    pub fn system() -> Self {
        Self::new("system", Role::Admin)
    }
}

/// An operation subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateRun,
    StartRun,
    PauseRun,
    ResumeRun,
    DeleteRun,
    ReadRun,
}

impl Action {
    /// Whether the action mutates run state.
    pub fn is_write(&self) -> bool {
        !matches!(self, Action::ReadRun)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::CreateRun => "create_run",
            Action::StartRun => "start_run",
            Action::PauseRun => "pause_run",
            Action::ResumeRun => "resume_run",
            Action::DeleteRun => "delete_run",
            Action::ReadRun => "read_run",
        };
        f.write_str(s)
    }
}

/// Decides whether a principal may perform an action.
pub trait Authorizer: Send + Sync {
    fn has_permission(&self, principal: &Principal, action: Action) -> bool;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn has_permission(&self, _principal: &Principal, _action: Action) -> bool {
        true
    }
}

/// Admins and engineers may do anything; viewers may only read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy;

impl Authorizer for RolePolicy {
    fn has_permission(&self, principal: &Principal, action: Action) -> bool {
        match principal.role {
            Role::Admin | Role::Engineer => true,
            Role::Viewer => !action.is_write(),
        }
    }
}
