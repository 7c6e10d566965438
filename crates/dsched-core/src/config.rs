//! dsched configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SchedError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DschedConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl DschedConfig {
    /// Load config from the default path (~/.dsched/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SchedError::Config(format!("Failed to parse config: {e}")))?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SchedError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the dsched home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dsched")
    }
}

/// What happens to a task whose dependency ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Cancel the dependent task before it starts.
    #[default]
    Cancel,
    /// Leave the dependent task waiting on its dependency.
    Wait,
}

/// Dispatch loop, worker pool and recurrence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// A pending task still blocked this long after its start time is reported as backlog.
    #[serde(default = "default_backlog_threshold_secs")]
    pub backlog_threshold_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_recurrence_horizon_days")]
    pub recurrence_horizon_days: u32,
    #[serde(default)]
    pub dependency_failure: DependencyFailurePolicy,
    /// Terminal tasks older than this are purged. 0 keeps them forever.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_tick_interval_ms() -> u64 { 1000 }
fn default_max_workers() -> usize { 4 }
fn default_backlog_threshold_secs() -> u64 { 300 }
fn default_shutdown_grace_secs() -> u64 { 30 }
fn default_recurrence_horizon_days() -> u32 { 3660 }
fn default_retention_secs() -> u64 { 86400 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_workers: default_max_workers(),
            backlog_threshold_secs: default_backlog_threshold_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            recurrence_horizon_days: default_recurrence_horizon_days(),
            dependency_failure: DependencyFailurePolicy::default(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(SchedError::Config("tick_interval_ms must be > 0".into()));
        }
        if self.max_workers == 0 {
            return Err(SchedError::Config("max_workers must be > 0".into()));
        }
        if self.recurrence_horizon_days == 0 {
            return Err(SchedError::Config(
                "recurrence_horizon_days must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Which persistence collaborator backs the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.dsched/tasks.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Store path with `~` expanded.
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// When false every principal may do everything.
    #[serde(default)]
    pub enforce: bool,
    /// Task kinds that may be scheduled. Empty allows every registered kind.
    #[serde(default)]
    pub allowed_kinds: Vec<String>,
    #[serde(default)]
    pub principals: Vec<PrincipalConfig>,
    /// Extra privilege a kind requires, e.g. `backup = "backend-backup"`.
    #[serde(default = "default_kind_privileges")]
    pub kind_privileges: HashMap<String, String>,
}

fn default_kind_privileges() -> HashMap<String, String> {
    [
        ("backup", "backend-backup"),
        ("restore", "backend-restore"),
        ("import", "ldif-import"),
        ("export", "ldif-export"),
        ("add-schema-file", "update-schema"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enforce: false,
            allowed_kinds: vec![],
            principals: vec![],
            kind_privileges: default_kind_privileges(),
        }
    }
}

/// A principal and the privileges it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalConfig {
    pub name: String,
    #[serde(default)]
    pub privileges: Vec<String>,
}

/// Completion notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

fn default_history_limit() -> usize { 100 }
fn default_webhook_timeout_secs() -> u64 { 10 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
        }
    }
}
