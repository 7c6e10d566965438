//! Privilege-based authorizer.
//!
//! Every task operation requires [`MANAGE_TASKS`]. Scheduling a kind listed in
//! `kind_privileges` additionally requires that kind's privilege, so only a
//! principal holding `backend-backup` can schedule a backup.

use std::collections::{HashMap, HashSet};

use dsched_core::config::SecurityConfig;
use dsched_core::traits::authorizer::{Authorizer, Operation, Principal};

use crate::allowlist::KindAllowlist;

/// Privilege required for any task operation.
pub const MANAGE_TASKS: &str = "manage-tasks";

/// Privilege that bypasses every check.
pub const BYPASS_ALL: &str = "bypass-acl";

/// Authorizer backed by configured principals and their privileges.
pub struct PrivilegeAuthorizer {
    enforce: bool,
    allowlist: KindAllowlist,
    principals: HashMap<String, HashSet<String>>,
    kind_privileges: HashMap<String, String>,
}

impl PrivilegeAuthorizer {
    pub fn new(config: &SecurityConfig) -> Self {
        let principals = config
            .principals
            .iter()
            .map(|p| (p.name.clone(), p.privileges.iter().cloned().collect()))
            .collect();
        Self {
            enforce: config.enforce,
            allowlist: KindAllowlist::new(config),
            principals,
            kind_privileges: config.kind_privileges.clone(),
        }
    }

    /// Grant a privilege to a principal.
    pub fn grant(&mut self, principal: &str, privilege: &str) {
        self.principals
            .entry(principal.to_string())
            .or_default()
            .insert(privilege.to_string());
    }

    /// Whether a principal holds a privilege.
    pub fn has_privilege(&self, principal: &Principal, privilege: &str) -> bool {
        self.principals
            .get(&principal.name)
            .is_some_and(|held| held.contains(privilege) || held.contains(BYPASS_ALL))
    }

    fn require(&self, principal: &Principal, privilege: &str) -> Result<(), String> {
        if self.has_privilege(principal, privilege) {
            Ok(())
        } else {
            Err(format!("'{principal}' lacks the {privilege} privilege"))
        }
    }

    fn check_kind(&self, principal: &Principal, kind: &str) -> Result<(), String> {
        if !self.allowlist.is_kind_allowed(kind) {
            return Err(format!("task kind '{kind}' is not allowed"));
        }
        if !self.enforce {
            return Ok(());
        }
        self.require(principal, MANAGE_TASKS)?;
        match self.kind_privileges.get(kind) {
            Some(privilege) => self.require(principal, privilege),
            None => Ok(()),
        }
    }
}

impl Authorizer for PrivilegeAuthorizer {
    fn authorize(&self, principal: &Principal, operation: &Operation<'_>) -> Result<(), String> {
        let result = match operation {
            Operation::Submit { kind } | Operation::ManageRecurring { kind } => {
                self.check_kind(principal, kind)
            }
            Operation::Modify { .. } | Operation::Cancel { .. } | Operation::Delete { .. } => {
                if self.enforce {
                    self.require(principal, MANAGE_TASKS)
                } else {
                    Ok(())
                }
            }
        };
        if let Err(reason) = &result {
            tracing::warn!("🚫 Denied {} for '{}': {}", operation, principal, reason);
        }
        result
    }
}
