//! Authorization collaborator, consulted before any administrative mutation.

use serde::{Deserialize, Serialize};

/// The authenticated identity issuing an administrative request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// An administrative operation awaiting authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    Submit { kind: &'a str },
    Modify { task_id: &'a str },
    Cancel { task_id: &'a str },
    Delete { task_id: &'a str },
    ManageRecurring { kind: &'a str },
}

impl std::fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Submit { kind } => write!(f, "submit '{kind}' task"),
            Operation::Modify { task_id } => write!(f, "modify task {task_id}"),
            Operation::Cancel { task_id } => write!(f, "cancel task {task_id}"),
            Operation::Delete { task_id } => write!(f, "delete task {task_id}"),
            Operation::ManageRecurring { kind } => {
                write!(f, "manage recurring '{kind}' task")
            }
        }
    }
}

/// Decides whether a principal may perform an operation.
pub trait Authorizer: Send + Sync {
    /// `Err(reason)` denies the operation; the scheduler does not attempt it.
    fn authorize(&self, principal: &Principal, operation: &Operation<'_>) -> Result<(), String>;
}

/// Authorizer that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _principal: &Principal, _operation: &Operation<'_>) -> Result<(), String> {
        Ok(())
    }
}
