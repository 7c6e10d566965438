//! Persistence collaborator.
//!
//! The scheduler writes every task record and recurring definition through a
//! [`TaskStore`] after each change, and rebuilds its registry from it on start.
//! Three backends: SQLite ([`crate::persistence::SqliteStore`]), a JSON file
//! store, and an in-memory store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dsched_core::config::{StoreBackend, StoreConfig};
use dsched_core::error::{Result, SchedError};

use crate::persistence::SqliteStore;
use crate::recurring::RecurringDefinition;
use crate::tasks::{DefinitionId, TaskId, TaskRecord};

/// Durable storage for task records and recurring definitions.
pub trait TaskStore: Send + Sync {
    /// Insert or replace a task record.
    fn save_task(&self, record: &TaskRecord) -> Result<()>;
    fn delete_task(&self, id: &TaskId) -> Result<()>;
    fn load_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Insert or replace a recurring definition.
    fn save_definition(&self, definition: &RecurringDefinition) -> Result<()>;
    fn delete_definition(&self, id: &DefinitionId) -> Result<()>;
    fn load_definitions(&self) -> Result<Vec<RecurringDefinition>>;

    /// Cheap reachability probe run at the start of every dispatch cycle.
    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the backend named in the configuration.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn TaskStore>> {
    let path = config.expanded_path();
    let store: Arc<dyn TaskStore> = match config.backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&path)?),
        StoreBackend::File => Arc::new(FileStore::new(&path)?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    tracing::info!("💾 Task store: {:?} ({})", config.backend, path.display());
    Ok(store)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| SchedError::Store("store lock poisoned".into()))
}

// ─── In-memory store ──────────────────────────────────────

#[derive(Default)]
struct MemoryContents {
    tasks: BTreeMap<TaskId, TaskRecord>,
    definitions: BTreeMap<DefinitionId, RecurringDefinition>,
}

/// Volatile store, also used by tests to simulate an unreachable backend.
#[derive(Default)]
pub struct MemoryStore {
    contents: Mutex<MemoryContents>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn contents(&self) -> Result<MutexGuard<'_, MemoryContents>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SchedError::Store("memory store is offline".into()));
        }
        lock(&self.contents)
    }
}

impl TaskStore for MemoryStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        self.contents()?
            .tasks
            .insert(record.id().clone(), record.clone());
        Ok(())
    }

    fn delete_task(&self, id: &TaskId) -> Result<()> {
        self.contents()?.tasks.remove(id);
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.contents()?.tasks.values().cloned().collect())
    }

    fn save_definition(&self, definition: &RecurringDefinition) -> Result<()> {
        self.contents()?
            .definitions
            .insert(definition.id().clone(), definition.clone());
        Ok(())
    }

    fn delete_definition(&self, id: &DefinitionId) -> Result<()> {
        self.contents()?.definitions.remove(id);
        Ok(())
    }

    fn load_definitions(&self) -> Result<Vec<RecurringDefinition>> {
        Ok(self.contents()?.definitions.values().cloned().collect())
    }

    fn health_check(&self) -> Result<()> {
        self.contents().map(|_| ())
    }
}

// ─── JSON file store ──────────────────────────────────────

/// File-based store: human-readable JSON, rewritten on every change.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a new file store in the given directory.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn tasks_file(&self) -> PathBuf {
        self.path.join("tasks.json")
    }

    fn definitions_file(&self) -> PathBuf {
        self.path.join("recurring.json")
    }

    fn read<T: serde::de::DeserializeOwned>(&self, file: &Path) -> Result<Vec<T>> {
        if !file.exists() {
            return Ok(Vec::new());
        }
        let json = std::fs::read_to_string(file)?;
        serde_json::from_str(&json)
            .map_err(|e| SchedError::Store(format!("Parse {}: {e}", file.display())))
    }

    fn write<T: serde::Serialize>(&self, file: &Path, items: &[T]) -> Result<()> {
        let json = serde_json::to_string_pretty(items)
            .map_err(|e| SchedError::Store(format!("Serialize error: {e}")))?;
        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, file)?;
        tracing::debug!("💾 Saved {} entries to {}", items.len(), file.display());
        Ok(())
    }

    fn upsert_task(&self, record: &TaskRecord, remove: bool) -> Result<()> {
        let _guard = lock(&self.write_lock)?;
        let file = self.tasks_file();
        let mut tasks: Vec<TaskRecord> = self.read(&file)?;
        tasks.retain(|t| t.id() != record.id());
        if !remove {
            tasks.push(record.clone());
        }
        self.write(&file, &tasks)
    }

    fn upsert_definition(&self, definition: &RecurringDefinition, remove: bool) -> Result<()> {
        let _guard = lock(&self.write_lock)?;
        let file = self.definitions_file();
        let mut definitions: Vec<RecurringDefinition> = self.read(&file)?;
        definitions.retain(|d| d.id() != definition.id());
        if !remove {
            definitions.push(definition.clone());
        }
        self.write(&file, &definitions)
    }
}

impl TaskStore for FileStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        self.upsert_task(record, false)
    }

    fn delete_task(&self, id: &TaskId) -> Result<()> {
        let _guard = lock(&self.write_lock)?;
        let file = self.tasks_file();
        let mut tasks: Vec<TaskRecord> = self.read(&file)?;
        tasks.retain(|t| t.id() != id);
        self.write(&file, &tasks)
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.read(&self.tasks_file())
    }

    fn save_definition(&self, definition: &RecurringDefinition) -> Result<()> {
        self.upsert_definition(definition, false)
    }

    fn delete_definition(&self, id: &DefinitionId) -> Result<()> {
        let _guard = lock(&self.write_lock)?;
        let file = self.definitions_file();
        let mut definitions: Vec<RecurringDefinition> = self.read(&file)?;
        definitions.retain(|d| d.id() != id);
        self.write(&file, &definitions)
    }

    fn load_definitions(&self) -> Result<Vec<RecurringDefinition>> {
        self.read(&self.definitions_file())
    }

    fn health_check(&self) -> Result<()> {
        if self.path.is_dir() {
            Ok(())
        } else {
            Err(SchedError::Store(format!(
                "store directory {} is missing",
                self.path.display()
            )))
        }
    }
}
