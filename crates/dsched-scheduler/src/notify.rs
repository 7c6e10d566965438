//! Completion notifications, built when a task reaches a terminal state,
//! kept in a bounded history and routed to the task's notify targets.

use serde::{Deserialize, Serialize};

use crate::dispatch::NotifyTarget;
use crate::state::TaskState;
use crate::tasks::{TaskId, TaskRecord};

/// A notification about a finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: TaskId,
    pub kind: String,
    pub state: TaskState,
    /// Title/summary.
    pub title: String,
    /// Body content.
    pub body: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    /// Build the notification for a record that just reached a terminal state.
    pub fn for_record(record: &TaskRecord) -> Self {
        let state = record.state();
        let emoji = if state.is_successful() { "✅" } else { "⚠️" };
        let details = record
            .completion()
            .and_then(|c| c.details.clone())
            .unwrap_or_default();
        let mut body = format!("Task {} ({}) ended in state {}", record.id(), record.kind(), state);
        if !details.is_empty() {
            body.push_str(": ");
            body.push_str(&details);
        }
        Self {
            task_id: record.id().clone(),
            kind: record.kind().to_string(),
            state,
            title: format!("{emoji} {} {}", record.kind(), state),
            body,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Notification router: remembers what was sent and picks the targets.
pub struct NotifyRouter {
    /// Notification history (ring buffer).
    history: Vec<Notification>,
    limit: usize,
}

impl NotifyRouter {
    pub fn new(limit: usize) -> Self {
        Self {
            history: Vec::new(),
            limit,
        }
    }

    /// Completion targets always; error targets only when the task did not succeed.
    pub fn targets_for(record: &TaskRecord) -> Vec<NotifyTarget> {
        let mut raw: Vec<&String> = record.notify_on_completion().iter().collect();
        if !record.state().is_successful() {
            raw.extend(record.notify_on_error());
        }

        let mut targets: Vec<NotifyTarget> = Vec::new();
        for spec in raw {
            match NotifyTarget::parse(spec) {
                Ok(target) if !targets.contains(&target) => targets.push(target),
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ Task {}: {e}", record.id()),
            }
        }
        targets
    }

    /// Record a notification in history.
    pub fn record(&mut self, notification: Notification) {
        self.history.push(notification);
        if self.history.len() > self.limit {
            let excess = self.history.len() - self.limit;
            self.history.drain(..excess);
        }
    }

    /// Get notification history, oldest first.
    pub fn history(&self) -> &[Notification] {
        &self.history
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new(100)
    }
}
