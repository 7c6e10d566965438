//! # dsched scheduler
//!
//! Administrative task scheduler for a directory server: one-off and
//! recurring tasks with start times, dependencies, cancellation and
//! persistence across restarts.
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval)
//!   ├── tick: pending tasks → due? dependencies done? worker free?
//!   │     └── worker pool (semaphore) → Runnable::execute(ctx)
//!   ├── admin surface: submit / modify / cancel / delete / list
//!   │     └── Authorizer → MutationPolicy → state machine → TaskStore
//!   ├── RecurringSupervisor: one live iteration per enabled definition
//!   └── terminal task → NotifyRouter → dispatch (webhook, log)
//!
//! TaskStore: SqliteStore | FileStore (JSON) | MemoryStore
//! ```

pub mod builtin;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod policy;
pub mod recurring;
pub mod registry;
pub mod schedule;
pub mod state;
pub mod store;
pub mod tasks;

pub use engine::{RecoveryReport, Scheduler, SchedulerBuilder, SchedulerStats, TickReport};
pub use notify::{Notification, NotifyRouter};
pub use persistence::SqliteStore;
pub use recurring::{RecurringDefinition, RecurringModification, RecurringSpec};
pub use registry::RunnableRegistry;
pub use schedule::RecurrenceRule;
pub use state::{TaskEvent, TaskState};
pub use store::{FileStore, MemoryStore, TaskStore, open_store};
pub use tasks::{
    AttributeChange, DefinitionId, StateClass, TaskFilter, TaskId, TaskModification, TaskRecord,
    TaskSpec,
};
