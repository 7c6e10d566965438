//! Mutation policy: what may change while a task is in a given state.
//!
//! | Current state        | Delete | Modify attributes | State -> cancel | State -> other |
//! |----------------------|--------|-------------------|-----------------|----------------|
//! | pending / disabled   | Allow  | Allow             | Allow           | Deny           |
//! | running              | Deny   | Deny              | Allow           | Deny           |
//! | terminal             | Allow  | Deny              | Deny            | Deny           |

use dsched_core::error::{DenyReason, Result, SchedError};

use crate::state::TaskState;
use crate::tasks::{RequestedState, TaskModification};

/// A proposed change to a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Delete,
    ModifyAttributes,
    Cancel,
    ModifyStateOther,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }

    /// Turn a denial into `MutationDenied`.
    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(SchedError::MutationDenied(reason)),
        }
    }
}

/// Decide whether `change` is allowed in state `current`.
pub fn authorize(current: TaskState, change: ChangeKind) -> Decision {
    if current.is_terminal() {
        return match change {
            ChangeKind::Delete => Decision::Allow,
            _ => Decision::Deny(DenyReason::TaskTerminal),
        };
    }

    if current.is_running() {
        return match change {
            ChangeKind::Cancel => Decision::Allow,
            ChangeKind::Delete => Decision::Deny(DenyReason::TaskInUse),
            ChangeKind::ModifyAttributes => Decision::Deny(DenyReason::TaskRunning),
            ChangeKind::ModifyStateOther => Decision::Deny(DenyReason::StateChangeNotAllowed),
        };
    }

    // Pending or disabled: nothing has started yet.
    match change {
        ChangeKind::Delete | ChangeKind::ModifyAttributes | ChangeKind::Cancel => Decision::Allow,
        ChangeKind::ModifyStateOther => Decision::Deny(DenyReason::StateChangeNotAllowed),
    }
}

/// The change kinds a modify request is made of, in the order they are checked.
pub fn changes_in(modification: &TaskModification) -> Vec<ChangeKind> {
    let mut changes = Vec::with_capacity(2);
    if modification.has_non_state_changes() {
        changes.push(ChangeKind::ModifyAttributes);
    }
    match &modification.state {
        Some(RequestedState::Cancel) => changes.push(ChangeKind::Cancel),
        Some(RequestedState::Other(_)) => changes.push(ChangeKind::ModifyStateOther),
        None => {}
    }
    changes
}

/// A modify request is allowed only when every change in it is.
pub fn authorize_modification(current: TaskState, modification: &TaskModification) -> Decision {
    changes_in(modification)
        .into_iter()
        .map(|change| authorize(current, change))
        .find(|decision| !decision.is_allowed())
        .unwrap_or(Decision::Allow)
}
