//! Recurring task definitions and the supervisor that keeps exactly one
//! pending (or running) iteration alive for each enabled definition.
//!
//! Lock order: the definitions map is taken before any engine lock, never
//! after. Callbacks from the engine (`iteration_ended`) arrive with no engine
//! lock held.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dsched_core::error::{Result, SchedError};
use dsched_core::traits::runnable::Attributes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::engine::Scheduler;
use crate::schedule::RecurrenceRule;
use crate::tasks::{AttributeChange, DefinitionId, TaskId, TaskRecord, TaskSpec};

/// What a caller submits to create a recurring definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecurringSpec {
    pub id: Option<DefinitionId>,
    pub kind: String,
    /// Five-field recurrence expression.
    pub schedule: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub notify_on_completion: Vec<String>,
    #[serde(default)]
    pub notify_on_error: Vec<String>,
}

impl RecurringSpec {
    pub fn new(kind: &str, schedule: &str) -> Self {
        Self {
            kind: kind.to_string(),
            schedule: schedule.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<DefinitionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn notify_on_completion(mut self, target: &str) -> Self {
        self.notify_on_completion.push(target.to_string());
        self
    }

    pub fn notify_on_error(mut self, target: &str) -> Self {
        self.notify_on_error.push(target.to_string());
        self
    }
}

/// A change to a recurring definition. Applied all-or-nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecurringModification {
    pub schedule: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeChange>,
}

impl RecurringModification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(mut self, expression: &str) -> Self {
        self.schedule = Some(expression.to_string());
        self
    }

    pub fn replace(mut self, name: &str, value: &str) -> Self {
        self.attributes.push(AttributeChange::Replace {
            name: name.to_string(),
            values: vec![value.to_string()],
        });
        self
    }
}

/// A template that materializes one task record per occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringDefinition {
    id: DefinitionId,
    kind: String,
    schedule: RecurrenceRule,
    attributes: Attributes,
    notify_on_completion: Vec<String>,
    notify_on_error: Vec<String>,
    enabled: bool,
    /// The iteration currently pending or running, if any.
    active_iteration: Option<TaskId>,
    iterations: u64,
    created_at: DateTime<Utc>,
}

impl RecurringDefinition {
    pub fn new(id: DefinitionId, spec: RecurringSpec, schedule: RecurrenceRule) -> Self {
        Self {
            id,
            kind: spec.kind,
            schedule,
            attributes: spec.attributes,
            notify_on_completion: spec.notify_on_completion,
            notify_on_error: spec.notify_on_error,
            enabled: true,
            active_iteration: None,
            iterations: 0,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &DefinitionId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn schedule(&self) -> &RecurrenceRule {
        &self.schedule
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn active_iteration(&self) -> Option<&TaskId> {
        self.active_iteration.as_ref()
    }

    /// How many iterations have been materialized so far.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Submission for the iteration that starts at `at`.
    fn iteration_spec(&self, at: DateTime<Utc>) -> TaskSpec {
        TaskSpec {
            id: Some(TaskId::new(format!(
                "{}-{}-{}",
                self.id,
                at.format("%Y%m%d%H%M"),
                self.iterations + 1
            ))),
            kind: self.kind.clone(),
            scheduled_start: Some(at),
            dependencies: Vec::new(),
            attributes: self.attributes.clone(),
            notify_on_completion: self.notify_on_completion.clone(),
            notify_on_error: self.notify_on_error.clone(),
        }
    }
}

/// Owns the recurring definitions and schedules their iterations.
pub struct RecurringSupervisor {
    definitions: Mutex<HashMap<DefinitionId, RecurringDefinition>>,
    horizon_days: u32,
}

impl RecurringSupervisor {
    pub(crate) fn new(horizon_days: u32) -> Self {
        Self {
            definitions: Mutex::new(HashMap::new()),
            horizon_days,
        }
    }

    fn next_occurrence(
        &self,
        definition: &RecurringDefinition,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        definition
            .schedule
            .next_after(after, self.horizon_days)
            .ok_or_else(|| SchedError::NoOccurrence {
                expression: definition.schedule.expression().to_string(),
                horizon_days: self.horizon_days,
            })
    }

    /// Validate, persist and schedule the first iteration of a new definition.
    pub(crate) async fn create(&self, core: &Scheduler, spec: RecurringSpec) -> Result<DefinitionId> {
        let rule = RecurrenceRule::parse(&spec.schedule)?;
        let mut definitions = self.definitions.lock().await;

        let id = spec.id.clone().unwrap_or_else(DefinitionId::generate);
        if definitions.contains_key(&id) {
            return Err(SchedError::DuplicateTask(id.to_string()));
        }

        let mut definition = RecurringDefinition::new(id.clone(), spec, rule);
        let first = self.next_occurrence(&definition, Utc::now())?;
        core.store().save_definition(&definition)?;
        if let Err(e) = self.materialize(core, &mut definition, first).await {
            if let Err(cleanup) = core.store().delete_definition(&id) {
                tracing::warn!("⚠️ Could not remove half-created definition {id}: {cleanup}");
            }
            return Err(e);
        }

        tracing::info!(
            "🔁 Recurring task added: {} '{}' ({}), first run {}",
            id,
            definition.kind,
            definition.schedule,
            first
        );
        definitions.insert(id.clone(), definition);
        Ok(id)
    }

    async fn materialize(
        &self,
        core: &Scheduler,
        definition: &mut RecurringDefinition,
        at: DateTime<Utc>,
    ) -> Result<TaskId> {
        let task_id = core
            .register(definition.iteration_spec(at), Some(definition.id.clone()))
            .await?;
        definition.active_iteration = Some(task_id.clone());
        definition.iterations += 1;
        if let Err(e) = core.store().save_definition(definition) {
            // The iteration itself is stored and points back at the definition,
            // so recovery can still find it.
            tracing::warn!("⚠️ Could not persist definition {}: {e}", definition.id);
        }
        Ok(task_id)
    }

    /// Make sure an enabled definition has a live iteration scheduled no
    /// earlier than `after`. Returns the live iteration, or `None` when disabled.
    async fn schedule_locked(
        &self,
        core: &Scheduler,
        definition: &mut RecurringDefinition,
        after: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        if !definition.enabled {
            return Ok(None);
        }
        if let Some(active) = &definition.active_iteration
            && core
                .task_state(active)
                .await
                .is_some_and(|state| !state.is_terminal())
        {
            return Ok(Some(active.clone()));
        }
        let at = self.next_occurrence(definition, after)?;
        self.materialize(core, definition, at).await.map(Some)
    }

    /// Schedule the next iteration of a definition, unless one is already live.
    pub(crate) async fn schedule(
        &self,
        core: &Scheduler,
        id: &DefinitionId,
    ) -> Result<Option<TaskId>> {
        let mut definitions = self.definitions.lock().await;
        let definition = definitions
            .get_mut(id)
            .ok_or_else(|| SchedError::UnknownDefinition(id.to_string()))?;
        self.schedule_locked(core, definition, Utc::now()).await
    }

    /// Called by the engine whenever an iteration reaches a terminal state.
    pub(crate) async fn iteration_ended(&self, core: &Scheduler, ended: &TaskRecord) {
        let Some(definition_id) = ended.recurring_definition() else {
            return;
        };
        let mut definitions = self.definitions.lock().await;
        let Some(definition) = definitions.get_mut(definition_id) else {
            return;
        };
        if definition.active_iteration.as_ref() != Some(ended.id()) {
            return;
        }
        definition.active_iteration = None;

        // Never reuse the slot of the iteration that just ended.
        let now = Utc::now();
        let after = ended.scheduled_start().map_or(now, |start| start.max(now));
        match self.schedule_locked(core, definition, after).await {
            Ok(Some(next)) => {
                tracing::info!("🔁 Next iteration of {definition_id} scheduled: {next}");
            }
            Ok(None) => self.persist(core, definition),
            Err(e) => {
                tracing::warn!("⚠️ Could not schedule next iteration of {definition_id}: {e}");
                self.persist(core, definition);
            }
        }
    }

    fn persist(&self, core: &Scheduler, definition: &RecurringDefinition) {
        if let Err(e) = core.store().save_definition(definition) {
            tracing::warn!("⚠️ Could not persist definition {}: {e}", definition.id);
        }
    }

    /// Apply a modification. A schedule change that does not parse, or that
    /// never fires, rejects the whole modification.
    pub(crate) async fn modify(
        &self,
        core: &Scheduler,
        id: &DefinitionId,
        modification: &RecurringModification,
    ) -> Result<()> {
        let mut definitions = self.definitions.lock().await;
        let definition = definitions
            .get_mut(id)
            .ok_or_else(|| SchedError::UnknownDefinition(id.to_string()))?;

        let mut updated = definition.clone();
        if let Some(expression) = &modification.schedule {
            updated.schedule = RecurrenceRule::parse(expression)?;
            self.next_occurrence(&updated, Utc::now())?;
        }
        for change in &modification.attributes {
            change.apply_to(&mut updated.attributes);
        }
        core.store().save_definition(&updated)?;

        let rescheduled = updated.schedule != definition.schedule;
        *definition = updated;
        tracing::info!("🔁 Recurring task {id} modified ({})", definition.schedule);

        // A pending iteration moves to the new schedule; a running one keeps going
        // and the new schedule applies from the next iteration on.
        if rescheduled
            && let Some(active) = definition.active_iteration.clone()
            && core.retire_pending(&active).await?
        {
            definition.active_iteration = None;
            self.schedule_locked(core, definition, Utc::now()).await?;
        }
        Ok(())
    }

    /// Remove a definition. Its pending iteration is canceled and removed; a
    /// running iteration is asked to stop.
    pub(crate) async fn delete(&self, core: &Scheduler, id: &DefinitionId) -> Result<()> {
        let definition = {
            let mut definitions = self.definitions.lock().await;
            if !definitions.contains_key(id) {
                return Err(SchedError::UnknownDefinition(id.to_string()));
            }
            core.store().delete_definition(id)?;
            definitions.remove(id)
        };

        if let Some(active) = definition.and_then(|d| d.active_iteration)
            && !core.retire_pending(&active).await?
        {
            core.stop_iteration(&active).await;
        }
        tracing::info!("🗑️ Recurring task deleted: {id}");
        Ok(())
    }

    /// Stop generating iterations; a pending iteration is canceled.
    pub(crate) async fn disable(&self, core: &Scheduler, id: &DefinitionId) -> Result<()> {
        let active = {
            let mut definitions = self.definitions.lock().await;
            let definition = definitions
                .get_mut(id)
                .ok_or_else(|| SchedError::UnknownDefinition(id.to_string()))?;
            if !definition.enabled {
                return Ok(());
            }
            definition.enabled = false;
            if let Err(e) = core.store().save_definition(definition) {
                definition.enabled = true;
                return Err(e);
            }
            definition.active_iteration.clone()
        };

        if let Some(active) = active {
            core.cancel_pending_iteration(&active).await;
        }
        tracing::info!("⏸️ Recurring task disabled: {id}");
        Ok(())
    }

    /// Resume generating iterations. Returns the iteration now scheduled.
    pub(crate) async fn enable(&self, core: &Scheduler, id: &DefinitionId) -> Result<Option<TaskId>> {
        let mut definitions = self.definitions.lock().await;
        let definition = definitions
            .get_mut(id)
            .ok_or_else(|| SchedError::UnknownDefinition(id.to_string()))?;
        if !definition.enabled {
            definition.enabled = true;
            if let Err(e) = core.store().save_definition(definition) {
                definition.enabled = false;
                return Err(e);
            }
            tracing::info!("▶️ Recurring task enabled: {id}");
        }
        self.schedule_locked(core, definition, Utc::now()).await
    }

    pub async fn get(&self, id: &DefinitionId) -> Result<RecurringDefinition> {
        self.definitions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedError::UnknownDefinition(id.to_string()))
    }

    pub async fn list(&self) -> Vec<RecurringDefinition> {
        let mut all: Vec<RecurringDefinition> =
            self.definitions.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Reload definitions after a restart. `live` maps each definition to its
    /// non-terminal iteration found in the store. Returns how many definitions
    /// needed a fresh iteration.
    pub(crate) async fn recover(
        &self,
        core: &Scheduler,
        loaded: Vec<RecurringDefinition>,
        live: &HashMap<DefinitionId, TaskId>,
    ) -> usize {
        let mut definitions = self.definitions.lock().await;
        let mut rescheduled = 0;
        for mut definition in loaded {
            definition.active_iteration = live.get(&definition.id).cloned();
            if definition.enabled && definition.active_iteration.is_none() {
                match self.schedule_locked(core, &mut definition, Utc::now()).await {
                    Ok(Some(_)) => rescheduled += 1,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        "⚠️ Recurring task {} has no next iteration: {e}",
                        definition.id
                    ),
                }
            }
            definitions.insert(definition.id.clone(), definition);
        }
        rescheduled
    }
}
