//! Task records, submissions and modifications: the core data model.

use chrono::{DateTime, Utc};
use dsched_core::error::Result;
use dsched_core::traits::runnable::{Attributes, ResultCode, TaskOutcome};
use serde::{Deserialize, Serialize};

use crate::state::{self, StopReason, TaskEvent, TaskState};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(
    /// Unique, immutable task identifier.
    TaskId,
    "task"
);
id_type!(
    /// Unique recurring task definition identifier.
    DefinitionId,
    "recurring"
);

/// A timestamped message appended to a task's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Set once, when a task enters a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub state: TaskState,
    /// Result code reported by the runnable, if it returned at all.
    pub code: Option<ResultCode>,
    pub details: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// What a caller submits to schedule a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id. A random one is assigned when absent.
    pub id: Option<TaskId>,
    pub kind: String,
    /// When absent the task is eligible immediately.
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub notify_on_completion: Vec<String>,
    #[serde(default)]
    pub notify_on_error: Vec<String>,
}

impl TaskSpec {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_start = Some(at);
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn notify_on_completion(mut self, target: &str) -> Self {
        self.notify_on_completion.push(target.to_string());
        self
    }

    pub fn notify_on_error(mut self, target: &str) -> Self {
        self.notify_on_error.push(target.to_string());
        self
    }
}

/// One schedulable unit of work.
///
/// Identity, kind and dependencies never change after creation. The state
/// only moves through [`TaskRecord::apply`], which runs the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    id: TaskId,
    kind: String,
    state: TaskState,
    scheduled_start: Option<DateTime<Utc>>,
    dependencies: Vec<TaskId>,
    recurring_definition: Option<DefinitionId>,
    attributes: Attributes,
    notify_on_completion: Vec<String>,
    notify_on_error: Vec<String>,
    completion: Option<CompletionResult>,
    created_at: DateTime<Utc>,
    actual_start: Option<DateTime<Utc>>,
    stop_requested: Option<StopReason>,
    /// Bumped on every change; lets callers detect stale snapshots.
    version: u64,
    #[serde(default)]
    log: Vec<LogMessage>,
}

impl TaskRecord {
    /// Build a new record in `WAITING_ON_START_TIME` from a submission.
    pub fn new(id: TaskId, spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: spec.kind,
            state: TaskState::WaitingOnStartTime,
            scheduled_start: spec.scheduled_start,
            dependencies: spec.dependencies,
            recurring_definition: None,
            attributes: spec.attributes,
            notify_on_completion: spec.notify_on_completion,
            notify_on_error: spec.notify_on_error,
            completion: None,
            created_at: now,
            actual_start: None,
            stop_requested: None,
            version: 0,
            log: vec![LogMessage {
                at: now,
                message: "Task scheduled".to_string(),
            }],
        }
    }

    pub(crate) fn with_recurring_definition(mut self, id: DefinitionId) -> Self {
        self.recurring_definition = Some(id);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn scheduled_start(&self) -> Option<DateTime<Utc>> {
        self.scheduled_start
    }

    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub fn recurring_definition(&self) -> Option<&DefinitionId> {
        self.recurring_definition.as_ref()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn notify_on_completion(&self) -> &[String] {
        &self.notify_on_completion
    }

    pub fn notify_on_error(&self) -> &[String] {
        &self.notify_on_error
    }

    pub fn completion(&self) -> Option<&CompletionResult> {
        self.completion.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn actual_start(&self) -> Option<DateTime<Utc>> {
        self.actual_start
    }

    pub fn stop_requested(&self) -> Option<StopReason> {
        self.stop_requested
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn log(&self) -> &[LogMessage] {
        &self.log
    }

    /// Whether the start time (if any) has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start.is_none_or(|start| start <= now)
    }

    /// Apply a state machine event. Entering a terminal state records the completion.
    pub fn apply(&mut self, event: TaskEvent) -> Result<TaskState> {
        self.apply_with_outcome(event, None)
    }

    /// Apply the event that ends a run, keeping the runnable's outcome.
    pub fn apply_with_outcome(
        &mut self,
        event: TaskEvent,
        outcome: Option<&TaskOutcome>,
    ) -> Result<TaskState> {
        let next = state::transition(self.state, event)?;
        if next == self.state {
            return Ok(next);
        }
        let now = Utc::now();
        if next.is_running() {
            self.actual_start = Some(now);
        }
        if next.is_terminal() {
            self.completion = Some(CompletionResult {
                state: next,
                code: outcome.map(|o| o.code),
                details: outcome.and_then(|o| o.details.clone()),
                completed_at: now,
            });
            self.stop_requested = None;
        }
        self.push_log(format!("State changed from {} to {}", self.state, next));
        self.state = next;
        self.version += 1;
        Ok(next)
    }

    /// Remember that a stop was posted to the running runnable.
    pub(crate) fn request_stop(&mut self, reason: StopReason) {
        if self.stop_requested.is_none() {
            self.stop_requested = Some(reason);
            self.push_log(match reason {
                StopReason::Administrator => "Cancel requested by administrator".to_string(),
                StopReason::Shutdown => "Stop requested by server shutdown".to_string(),
            });
            self.version += 1;
        }
    }

    /// Apply non-state changes. Callers check the mutation policy first.
    pub(crate) fn apply_changes(&mut self, modification: &TaskModification) {
        for change in &modification.attributes {
            change.apply_to(&mut self.attributes);
        }
        if let Some(start) = modification.scheduled_start {
            self.scheduled_start = start;
        }
        if modification.has_non_state_changes() {
            self.push_log("Task attributes modified".to_string());
            self.version += 1;
        }
    }

    pub(crate) fn push_log(&mut self, message: String) {
        self.log.push(LogMessage {
            at: Utc::now(),
            message,
        });
    }
}

/// One change to the opaque attribute payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeChange {
    Replace { name: String, values: Vec<String> },
    Add { name: String, values: Vec<String> },
    /// Remove the listed values, or the whole attribute when `values` is empty.
    Remove { name: String, values: Vec<String> },
}

impl AttributeChange {
    pub(crate) fn apply_to(&self, attributes: &mut Attributes) {
        match self {
            AttributeChange::Replace { name, values } => {
                if values.is_empty() {
                    attributes.remove(name);
                } else {
                    attributes.insert(name.clone(), values.clone());
                }
            }
            AttributeChange::Add { name, values } => {
                attributes
                    .entry(name.clone())
                    .or_default()
                    .extend(values.iter().cloned());
            }
            AttributeChange::Remove { name, values } => {
                if values.is_empty() {
                    attributes.remove(name);
                } else if let Some(current) = attributes.get_mut(name) {
                    current.retain(|v| !values.contains(v));
                    if current.is_empty() {
                        attributes.remove(name);
                    }
                }
            }
        }
    }
}

/// A state value requested through a modify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedState {
    Cancel,
    Other(String),
}

impl From<&str> for RequestedState {
    fn from(s: &str) -> Self {
        let normalized = s.trim().replace('-', "_").to_ascii_lowercase();
        match normalized.as_str() {
            "cancel" | "canceled_before_starting" | "cancelled" | "canceled" => {
                RequestedState::Cancel
            }
            _ => RequestedState::Other(s.trim().to_string()),
        }
    }
}

/// A modify request against a task record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskModification {
    #[serde(default)]
    pub attributes: Vec<AttributeChange>,
    /// `Some(None)` clears the start time, making the task eligible immediately.
    #[serde(default)]
    pub scheduled_start: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub state: Option<RequestedState>,
}

impl TaskModification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(mut self, name: &str, value: &str) -> Self {
        self.attributes.push(AttributeChange::Replace {
            name: name.to_string(),
            values: vec![value.to_string()],
        });
        self
    }

    pub fn add(mut self, name: &str, value: &str) -> Self {
        self.attributes.push(AttributeChange::Add {
            name: name.to_string(),
            values: vec![value.to_string()],
        });
        self
    }

    pub fn remove(mut self, name: &str) -> Self {
        self.attributes.push(AttributeChange::Remove {
            name: name.to_string(),
            values: vec![],
        });
        self
    }

    pub fn reschedule(mut self, start: Option<DateTime<Utc>>) -> Self {
        self.scheduled_start = Some(start);
        self
    }

    pub fn set_state(mut self, state: &str) -> Self {
        self.state = Some(RequestedState::from(state));
        self
    }

    pub fn cancel() -> Self {
        Self {
            state: Some(RequestedState::Cancel),
            ..Default::default()
        }
    }

    pub fn has_non_state_changes(&self) -> bool {
        !self.attributes.is_empty() || self.scheduled_start.is_some()
    }
}

/// Coarse state grouping used by list filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Pending,
    Running,
    Disabled,
    Terminal,
}

impl StateClass {
    pub fn of(state: TaskState) -> Self {
        if state.is_pending() {
            StateClass::Pending
        } else if state.is_running() {
            StateClass::Running
        } else if state.is_disabled() {
            StateClass::Disabled
        } else {
            StateClass::Terminal
        }
    }
}

/// Criteria for listing task records. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub class: Option<StateClass>,
    pub kind: Option<String>,
    pub recurring_definition: Option<DefinitionId>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_class(class: StateClass) -> Self {
        Self {
            class: Some(class),
            ..Default::default()
        }
    }

    pub fn for_definition(id: &DefinitionId) -> Self {
        Self {
            recurring_definition: Some(id.clone()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.class.is_none_or(|c| c == StateClass::of(record.state()))
            && self.kind.as_deref().is_none_or(|k| k == record.kind())
            && self
                .recurring_definition
                .as_ref()
                .is_none_or(|d| record.recurring_definition() == Some(d))
    }
}
