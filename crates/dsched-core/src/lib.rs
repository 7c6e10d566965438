//! # dsched core
//!
//! Shared configuration, the administrative error taxonomy and the
//! collaborator traits (runnable task bodies, authorization) used by the
//! scheduler and security crates.

pub mod config;
pub mod error;
pub mod traits;

pub use config::DschedConfig;
pub use error::{AdminResultCode, DenyReason, ParseError, Result, SchedError};
pub use traits::authorizer::{AllowAll, Authorizer, Operation, Principal};
pub use traits::runnable::{
    Attributes, ResultCode, Runnable, StopSignal, TaskContext, TaskOutcome,
};
