//! Collaborator interfaces the scheduler depends on.

pub mod authorizer;
pub mod runnable;
