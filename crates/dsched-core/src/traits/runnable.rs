//! Runnable trait: the opaque capability that performs a task's work.
//!
//! The scheduler resolves a runnable by the task's `kind` at dispatch time,
//! hands it the task attributes and a [`StopSignal`], and records whatever
//! [`TaskOutcome`] it returns. Stopping is cooperative: a runnable that never
//! looks at its stop signal keeps running.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Opaque multi-valued attribute payload interpreted only by the runnable.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// Result code a runnable reports when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success,
    Error,
}

/// What a runnable hands back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub code: ResultCode,
    /// Free-form details, never interpreted by the scheduler.
    pub details: Option<String>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self {
            code: ResultCode::Success,
            details: None,
        }
    }

    pub fn error(details: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Error,
            details: Some(details.into()),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Cooperative stop request delivered to a running task.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the runnable to stop. Never blocks.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Everything a runnable gets to see about the task it executes.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub kind: String,
    pub attributes: Attributes,
    pub stop: StopSignal,
}

impl TaskContext {
    /// First value of an attribute, if any.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// A task body, resolved by kind.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// The task kind this runnable implements.
    fn kind(&self) -> &str;

    /// Execute the task. Failures are reported through the outcome, not by panicking.
    async fn execute(&self, ctx: TaskContext) -> TaskOutcome;
}
