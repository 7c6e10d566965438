//! Task kind allowlist management.
//!
//! Controls which task kinds may be scheduled. An empty allowlist allows
//! every kind.

use dsched_core::config::SecurityConfig;
use std::collections::HashSet;

/// Manages the set of task kinds that may be scheduled.
#[derive(Debug, Clone, Default)]
pub struct KindAllowlist {
    allowed_kinds: HashSet<String>,
}

impl KindAllowlist {
    /// Create a new allowlist from security configuration.
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            allowed_kinds: config.allowed_kinds.iter().map(|k| normalize(k)).collect(),
        }
    }

    /// Check if a task kind may be scheduled.
    pub fn is_kind_allowed(&self, kind: &str) -> bool {
        self.allowed_kinds.is_empty() || self.allowed_kinds.contains(&normalize(kind))
    }

    /// Add a kind to the allowlist.
    pub fn allow_kind(&mut self, kind: &str) {
        self.allowed_kinds.insert(normalize(kind));
    }

    /// Remove a kind from the allowlist.
    pub fn deny_kind(&mut self, kind: &str) {
        self.allowed_kinds.remove(&normalize(kind));
    }
}

fn normalize(kind: &str) -> String {
    kind.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allows_everything() {
        let list = KindAllowlist::new(&SecurityConfig::default());
        assert!(list.is_kind_allowed("sleep"));
        assert!(list.is_kind_allowed("backup"));
    }

    #[test]
    fn test_allow_and_deny() {
        let config = SecurityConfig {
            allowed_kinds: vec!["Sleep".into()],
            ..Default::default()
        };
        let mut list = KindAllowlist::new(&config);
        assert!(list.is_kind_allowed("sleep"));
        assert!(!list.is_kind_allowed("backup"));

        list.allow_kind("backup");
        assert!(list.is_kind_allowed("BACKUP"));

        list.deny_kind("backup");
        assert!(!list.is_kind_allowed("backup"));
    }
}
