//! Runnable registry: maps a task kind to the capability that executes it.

use std::collections::HashMap;
use std::sync::Arc;

use dsched_core::traits::runnable::Runnable;

#[derive(Default, Clone)]
pub struct RunnableRegistry {
    runnables: HashMap<String, Arc<dyn Runnable>>,
}

impl RunnableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in kinds (`sleep`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::builtin::SleepTask));
        registry
    }

    /// Register a runnable under its kind, replacing any previous one.
    pub fn register(&mut self, runnable: Arc<dyn Runnable>) {
        let kind = runnable.kind().to_ascii_lowercase();
        if self.runnables.insert(kind.clone(), runnable).is_some() {
            tracing::debug!("Replaced runnable for kind '{kind}'");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Runnable>> {
        self.runnables.get(&kind.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.runnables.contains_key(&kind.to_ascii_lowercase())
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.runnables.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
