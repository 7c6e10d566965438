//! Error taxonomy for the task scheduler.
//!
//! Every error here is reported synchronously to the caller of the
//! administrative surface. None of them is retried internally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across all dsched crates.
pub type Result<T> = std::result::Result<T, SchedError>;

/// Errors surfaced by the scheduler's administrative operations.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("Invalid schedule expression: {0}")]
    Parse(#[from] ParseError),

    #[error("Schedule '{expression}' has no occurrence within {horizon_days} days")]
    NoOccurrence { expression: String, horizon_days: u32 },

    #[error("Invalid transition: cannot apply '{event}' to a task in state {from}")]
    InvalidTransition { from: String, event: String },

    #[error("Mutation denied: {0}")]
    MutationDenied(DenyReason),

    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown recurring task definition: {0}")]
    UnknownDefinition(String),

    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the mutation policy refused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The task is running and cannot be deleted.
    TaskInUse,
    /// Only the state of a running task may change, and only to cancel it.
    TaskRunning,
    /// The task already reached a terminal state.
    TaskTerminal,
    /// The requested state change is not a cancel.
    StateChangeNotAllowed,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::TaskInUse => write!(f, "task is in use (running)"),
            DenyReason::TaskRunning => {
                write!(f, "only a cancel request is allowed while the task is running")
            }
            DenyReason::TaskTerminal => write!(f, "task has already completed"),
            DenyReason::StateChangeNotAllowed => {
                write!(f, "the task state may only be changed to cancel")
            }
        }
    }
}

/// A malformed recurrence expression. The whole expression is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected 5 fields (MIN HOUR DOM MON DOW), found {found}")]
    FieldCountMismatch { found: usize },

    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field} range {start}-{end} is reversed")]
    InvalidRange {
        field: &'static str,
        start: u32,
        end: u32,
    },

    #[error("{field} step '{step}' must be a positive integer")]
    InvalidStep { field: &'static str, step: String },

    #[error("{field} term '{term}' has a malformed step")]
    MalformedStep { field: &'static str, term: String },

    #[error("{field} term '{term}' is not a number, range or wildcard")]
    InvalidValue { field: &'static str, term: String },
}

/// Result codes handed back to the protocol layer, LDAP-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminResultCode {
    Success,
    ConstraintViolation,
    InvalidAttributeSyntax,
    NoSuchObject,
    InsufficientAccessRights,
    UnwillingToPerform,
    EntryAlreadyExists,
    Other,
}

impl AdminResultCode {
    /// Numeric protocol value.
    pub fn code(self) -> u16 {
        match self {
            AdminResultCode::Success => 0,
            AdminResultCode::ConstraintViolation => 19,
            AdminResultCode::InvalidAttributeSyntax => 21,
            AdminResultCode::NoSuchObject => 32,
            AdminResultCode::InsufficientAccessRights => 50,
            AdminResultCode::UnwillingToPerform => 53,
            AdminResultCode::EntryAlreadyExists => 68,
            AdminResultCode::Other => 80,
        }
    }
}

impl SchedError {
    /// Map this error to the result code reported to the protocol layer.
    pub fn result_code(&self) -> AdminResultCode {
        match self {
            SchedError::Parse(_) | SchedError::NoOccurrence { .. } => {
                AdminResultCode::InvalidAttributeSyntax
            }
            SchedError::InvalidTransition { .. }
            | SchedError::MutationDenied(_)
            | SchedError::UnknownTaskKind(_) => AdminResultCode::UnwillingToPerform,
            SchedError::UnknownDependency(_) => AdminResultCode::ConstraintViolation,
            SchedError::UnknownTask(_) | SchedError::UnknownDefinition(_) => {
                AdminResultCode::NoSuchObject
            }
            SchedError::DuplicateTask(_) => AdminResultCode::EntryAlreadyExists,
            SchedError::Unauthorized(_) => AdminResultCode::InsufficientAccessRights,
            SchedError::Store(_) | SchedError::Config(_) | SchedError::Io(_) => {
                AdminResultCode::Other
            }
        }
    }

    /// Whether this is the `TaskInUse` denial for deleting a running task.
    pub fn is_task_in_use(&self) -> bool {
        matches!(self, SchedError::MutationDenied(DenyReason::TaskInUse))
    }
}
