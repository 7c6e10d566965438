//! SQLite-backed persistence for task records and recurring definitions.
//! Survives restarts; the default store backend.

use std::path::Path;
use std::sync::Mutex;

use dsched_core::error::{Result, SchedError};

use crate::recurring::RecurringDefinition;
use crate::store::{TaskStore, lock};
use crate::tasks::{DefinitionId, TaskId, TaskRecord};

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> SchedError + '_ {
    move |e| SchedError::Store(format!("{context}: {e}"))
}

/// SQLite-backed store. Each row carries the full record as JSON plus a few
/// indexed columns for inspection with the `sqlite3` shell.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        lock(&self.conn)?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                recurring_definition TEXT,
                scheduled_start TEXT,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL               -- JSON TaskRecord
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);

            CREATE TABLE IF NOT EXISTS recurring_definitions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                schedule TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                data TEXT NOT NULL               -- JSON RecurringDefinition
            );
         ",
            )
            .map_err(db_err("Migration"))
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(sql).map_err(db_err("Prepare"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err("Query"))?;

        let mut items = Vec::new();
        for row in rows {
            let json = row.map_err(db_err("Read row"))?;
            match serde_json::from_str(&json) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable row: {e}"),
            }
        }
        Ok(items)
    }
}

impl TaskStore for SqliteStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let data = serde_json::to_string(record)
            .map_err(|e| SchedError::Store(format!("Serialize task: {e}")))?;
        lock(&self.conn)?
            .execute(
                "INSERT OR REPLACE INTO tasks
                 (id, kind, state, recurring_definition, scheduled_start, created_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.id().as_str(),
                    record.kind(),
                    record.state().as_str(),
                    record.recurring_definition().map(|d| d.as_str()),
                    record.scheduled_start().map(|t| t.to_rfc3339()),
                    record.created_at().to_rfc3339(),
                    data,
                ],
            )
            .map_err(db_err("Save task"))?;
        Ok(())
    }

    fn delete_task(&self, id: &TaskId) -> Result<()> {
        lock(&self.conn)?
            .execute("DELETE FROM tasks WHERE id = ?1", [id.as_str()])
            .map_err(db_err("Delete task"))?;
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.load_json("SELECT data FROM tasks ORDER BY created_at")
    }

    fn save_definition(&self, definition: &RecurringDefinition) -> Result<()> {
        let data = serde_json::to_string(definition)
            .map_err(|e| SchedError::Store(format!("Serialize definition: {e}")))?;
        lock(&self.conn)?
            .execute(
                "INSERT OR REPLACE INTO recurring_definitions (id, kind, schedule, enabled, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    definition.id().as_str(),
                    definition.kind(),
                    definition.schedule().expression(),
                    definition.is_enabled() as i32,
                    data,
                ],
            )
            .map_err(db_err("Save definition"))?;
        Ok(())
    }

    fn delete_definition(&self, id: &DefinitionId) -> Result<()> {
        lock(&self.conn)?
            .execute(
                "DELETE FROM recurring_definitions WHERE id = ?1",
                [id.as_str()],
            )
            .map_err(db_err("Delete definition"))?;
        Ok(())
    }

    fn load_definitions(&self) -> Result<Vec<RecurringDefinition>> {
        self.load_json("SELECT data FROM recurring_definitions ORDER BY id")
    }

    fn health_check(&self) -> Result<()> {
        lock(&self.conn)?
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(db_err("Health check"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurring::RecurringSpec;
    use crate::schedule::RecurrenceRule;
    use crate::state::TaskEvent;
    use crate::tasks::TaskSpec;

    #[test]
    fn test_task_persistence() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = TaskRecord::new(
            TaskId::new("backup-1"),
            TaskSpec::new("backup").attribute("backend-id", "userRoot"),
        );
        store.save_task(&record).unwrap();

        record.apply(TaskEvent::Start).unwrap();
        store.save_task(&record).unwrap();

        let loaded = store.load_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].state().is_running());
        assert_eq!(loaded[0].attributes()["backend-id"], vec!["userRoot".to_string()]);

        store.delete_task(record.id()).unwrap();
        assert!(store.load_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_definition_persistence() {
        let store = SqliteStore::open_in_memory().unwrap();
        let definition = RecurringDefinition::new(
            DefinitionId::new("nightly"),
            RecurringSpec::new("backup", "0 2 * * *"),
            RecurrenceRule::parse("0 2 * * *").unwrap(),
        );
        store.save_definition(&definition).unwrap();
        let loaded = store.load_definitions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind(), "backup");
        assert!(loaded[0].is_enabled());
    }

    #[test]
    fn test_open_file_db() {
        let path = std::env::temp_dir().join("dsched-sqlite-test/tasks.db");
        std::fs::remove_file(&path).ok();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.health_check().unwrap();
            store
                .save_task(&TaskRecord::new(TaskId::new("t"), TaskSpec::new("sleep")))
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load_tasks().unwrap().len(), 1);
        std::fs::remove_file(&path).ok();
    }
}
