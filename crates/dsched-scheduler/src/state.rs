//! Task state machine.
//!
//! State transitions:
//! - WaitingOnStartTime <-> WaitingOnDependency (both "pending")
//! - pending -> Running -> CompletedSuccessfully | CompletedWithErrors
//! - pending | Disabled -> CanceledBeforeStarting
//! - Running -> StoppedByAdministrator (cancel) | StoppedByShutdown
//! - pending <-> Disabled
//!
//! Terminal states accept no event at all.

use dsched_core::error::{Result, SchedError};
use dsched_core::traits::runnable::ResultCode;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Pending: start time not reached yet.
    WaitingOnStartTime,
    /// Pending: start time reached but a dependency has not completed successfully.
    WaitingOnDependency,
    /// Excluded from dispatch until re-enabled.
    Disabled,
    Running,
    CanceledBeforeStarting,
    CompletedSuccessfully,
    CompletedWithErrors,
    StoppedByAdministrator,
    StoppedByShutdown,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::WaitingOnStartTime,
        TaskState::WaitingOnDependency,
        TaskState::Disabled,
        TaskState::Running,
        TaskState::CanceledBeforeStarting,
        TaskState::CompletedSuccessfully,
        TaskState::CompletedWithErrors,
        TaskState::StoppedByAdministrator,
        TaskState::StoppedByShutdown,
    ];

    pub fn is_pending(self) -> bool {
        matches!(
            self,
            TaskState::WaitingOnStartTime | TaskState::WaitingOnDependency
        )
    }

    pub fn is_running(self) -> bool {
        self == TaskState::Running
    }

    pub fn is_disabled(self) -> bool {
        self == TaskState::Disabled
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::CanceledBeforeStarting
                | TaskState::CompletedSuccessfully
                | TaskState::CompletedWithErrors
                | TaskState::StoppedByAdministrator
                | TaskState::StoppedByShutdown
        )
    }

    /// Only a successful completion satisfies a dependency.
    pub fn is_successful(self) -> bool {
        self == TaskState::CompletedSuccessfully
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::WaitingOnStartTime => "WAITING_ON_START_TIME",
            TaskState::WaitingOnDependency => "WAITING_ON_DEPENDENCY",
            TaskState::Disabled => "DISABLED",
            TaskState::Running => "RUNNING",
            TaskState::CanceledBeforeStarting => "CANCELED_BEFORE_STARTING",
            TaskState::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            TaskState::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            TaskState::StoppedByAdministrator => "STOPPED_BY_ADMINISTRATOR",
            TaskState::StoppedByShutdown => "STOPPED_BY_SHUTDOWN",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_uppercase();
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown task state '{s}'"))
    }
}

/// Why a running task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Administrator,
    Shutdown,
}

/// What a pending task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    StartTime,
    Dependency,
}

/// Something that happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Reclassify a pending task.
    Wait(WaitReason),
    /// Dispatch handed the task to a worker.
    Start,
    /// The runnable returned.
    Complete(ResultCode),
    /// Administrative cancel.
    Cancel,
    /// A dependency ended without succeeding.
    DependencyFailed,
    /// Process-wide shutdown while running.
    Shutdown,
    Disable,
    Enable,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::Wait(WaitReason::StartTime) => write!(f, "wait-on-start-time"),
            TaskEvent::Wait(WaitReason::Dependency) => write!(f, "wait-on-dependency"),
            TaskEvent::Start => write!(f, "start"),
            TaskEvent::Complete(ResultCode::Success) => write!(f, "complete"),
            TaskEvent::Complete(ResultCode::Error) => write!(f, "complete-with-errors"),
            TaskEvent::Cancel => write!(f, "cancel"),
            TaskEvent::DependencyFailed => write!(f, "dependency-failed"),
            TaskEvent::Shutdown => write!(f, "shutdown"),
            TaskEvent::Disable => write!(f, "disable"),
            TaskEvent::Enable => write!(f, "enable"),
        }
    }
}

impl From<StopReason> for TaskEvent {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Administrator => TaskEvent::Cancel,
            StopReason::Shutdown => TaskEvent::Shutdown,
        }
    }
}

/// Next state for `event` applied in state `from`, or `InvalidTransition`.
pub fn transition(from: TaskState, event: TaskEvent) -> Result<TaskState> {
    use TaskState::*;

    let next = match (from, event) {
        (WaitingOnStartTime | WaitingOnDependency, TaskEvent::Wait(WaitReason::StartTime)) => {
            Some(WaitingOnStartTime)
        }
        (WaitingOnStartTime | WaitingOnDependency, TaskEvent::Wait(WaitReason::Dependency)) => {
            Some(WaitingOnDependency)
        }
        (WaitingOnStartTime | WaitingOnDependency, TaskEvent::Start) => Some(Running),
        (WaitingOnStartTime | WaitingOnDependency | Disabled, TaskEvent::Cancel) => {
            Some(CanceledBeforeStarting)
        }
        (WaitingOnStartTime | WaitingOnDependency, TaskEvent::DependencyFailed) => {
            Some(CanceledBeforeStarting)
        }
        (WaitingOnStartTime | WaitingOnDependency, TaskEvent::Disable) => Some(Disabled),
        (Disabled, TaskEvent::Enable) => Some(WaitingOnStartTime),
        (Running, TaskEvent::Complete(ResultCode::Success)) => Some(CompletedSuccessfully),
        (Running, TaskEvent::Complete(ResultCode::Error)) => Some(CompletedWithErrors),
        (Running, TaskEvent::Cancel) => Some(StoppedByAdministrator),
        (Running, TaskEvent::Shutdown) => Some(StoppedByShutdown),
        _ => None,
    };

    next.ok_or_else(|| SchedError::InvalidTransition {
        from: from.to_string(),
        event: event.to_string(),
    })
}
