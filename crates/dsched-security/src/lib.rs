//! # dsched security
//!
//! Authorization collaborators for the task scheduler: which task kinds may
//! be scheduled at all, and which privileges a principal needs to schedule,
//! modify, cancel or delete them.

pub mod allowlist;
pub mod privileges;

pub use allowlist::KindAllowlist;
pub use privileges::{PrivilegeAuthorizer, MANAGE_TASKS};
