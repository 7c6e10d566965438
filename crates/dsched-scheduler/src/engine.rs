//! Scheduler engine: task registry, dispatch loop, worker pool and the
//! administrative surface.
//! Uses tokio::interval for ticking and a semaphore to bound concurrent runs.
//!
//! Lock order, outermost first:
//! recurring definitions -> registry -> one task record -> active runs / unsaved set.
//! At most one record lock is held at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dsched_core::config::{DependencyFailurePolicy, NotifyConfig, SchedulerConfig};
use dsched_core::error::{Result, SchedError};
use dsched_core::traits::authorizer::{AllowAll, Authorizer, Operation, Principal};
use dsched_core::traits::runnable::{Runnable, StopSignal, TaskContext, TaskOutcome};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::dispatch;
use crate::notify::{Notification, NotifyRouter};
use crate::policy::{self, ChangeKind};
use crate::recurring::{
    RecurringDefinition, RecurringModification, RecurringSpec, RecurringSupervisor,
};
use crate::registry::RunnableRegistry;
use crate::state::{self, StopReason, TaskEvent, TaskState, WaitReason};
use crate::store::{MemoryStore, TaskStore};
use crate::tasks::{
    DefinitionId, RequestedState, StateClass, TaskFilter, TaskId, TaskModification, TaskRecord,
    TaskSpec,
};

type Slot = Arc<Mutex<TaskRecord>>;

/// What one dispatch cycle did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub started: Vec<TaskId>,
    /// Canceled because a dependency failed.
    pub canceled: Vec<TaskId>,
    /// Due tasks still blocked past the backlog threshold.
    pub backlog: usize,
    pub purged: usize,
    /// The cycle was skipped (store unreachable or shutting down).
    pub skipped: bool,
    /// A start could not be persisted; remaining tasks wait for the next cycle.
    pub persist_failed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub tasks: usize,
    pub definitions: usize,
    /// Tasks found RUNNING and marked STOPPED_BY_SHUTDOWN.
    pub interrupted: usize,
    /// Definitions that got a fresh iteration.
    pub rescheduled: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total: usize,
    pub waiting_on_start_time: usize,
    pub waiting_on_dependency: usize,
    pub disabled: usize,
    pub running: usize,
    pub completed_successfully: usize,
    pub completed_with_errors: usize,
    pub canceled_before_starting: usize,
    pub stopped_by_administrator: usize,
    pub stopped_by_shutdown: usize,
    pub recurring_definitions: usize,
    pub busy_workers: usize,
    pub max_workers: usize,
    /// Pending tasks overdue by more than the backlog threshold.
    pub backlog: usize,
}

enum Dependencies {
    Satisfied,
    Waiting,
    Failed(TaskId),
}

enum CancelEffect {
    Canceled,
    StopRequested,
}

struct Inner {
    config: SchedulerConfig,
    notify_config: NotifyConfig,
    store: Arc<dyn TaskStore>,
    authorizer: Arc<dyn Authorizer>,
    runnables: RunnableRegistry,
    registry: RwLock<HashMap<TaskId, Slot>>,
    recurring: RecurringSupervisor,
    workers: Arc<Semaphore>,
    /// Stop signals of tasks currently on a worker.
    active: Mutex<HashMap<TaskId, StopSignal>>,
    /// Terminal records whose last save failed.
    unsaved: Mutex<HashSet<TaskId>>,
    notifier: Mutex<NotifyRouter>,
    http: reqwest::Client,
    shutdown: CancellationToken,
    /// Held for the whole of a dispatch cycle.
    cycle: Mutex<()>,
}

/// Builds a [`Scheduler`]. Defaults: in-memory store, allow-all authorizer,
/// built-in runnables only.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    notify_config: NotifyConfig,
    store: Option<Arc<dyn TaskStore>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    runnables: RunnableRegistry,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notify_config(mut self, config: NotifyConfig) -> Self {
        self.notify_config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn runnable(mut self, runnable: Arc<dyn Runnable>) -> Self {
        self.runnables.register(runnable);
        self
    }

    pub fn runnables(mut self, runnables: RunnableRegistry) -> Self {
        self.runnables = runnables;
        self
    }

    pub fn build(self) -> Scheduler {
        let max_workers = self.config.max_workers.max(1);
        let horizon_days = self.config.recurrence_horizon_days;
        Scheduler {
            inner: Arc::new(Inner {
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                authorizer: self.authorizer.unwrap_or_else(|| Arc::new(AllowAll)),
                runnables: self.runnables,
                registry: RwLock::new(HashMap::new()),
                recurring: RecurringSupervisor::new(horizon_days),
                workers: Arc::new(Semaphore::new(max_workers)),
                active: Mutex::new(HashMap::new()),
                unsaved: Mutex::new(HashSet::new()),
                notifier: Mutex::new(NotifyRouter::new(self.notify_config.history_limit)),
                http: reqwest::Client::new(),
                shutdown: CancellationToken::new(),
                cycle: Mutex::new(()),
                config: self.config,
                notify_config: self.notify_config,
            }),
        }
    }
}

/// The administrative task scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            notify_config: NotifyConfig::default(),
            store: None,
            authorizer: None,
            runnables: RunnableRegistry::with_builtins(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn runnables(&self) -> &RunnableRegistry {
        &self.inner.runnables
    }

    pub(crate) fn store(&self) -> &dyn TaskStore {
        self.inner.store.as_ref()
    }

    fn authorize(&self, principal: &Principal, operation: Operation<'_>) -> Result<()> {
        self.inner
            .authorizer
            .authorize(principal, &operation)
            .map_err(|reason| {
                SchedError::Unauthorized(format!("{principal} may not {operation}: {reason}"))
            })
    }

    /// Save `record`, restoring `before` in memory if the store refuses.
    fn persist(&self, record: &mut TaskRecord, before: TaskRecord) -> Result<()> {
        if let Err(e) = self.inner.store.save_task(record) {
            *record = before;
            return Err(e);
        }
        Ok(())
    }

    async fn slot(&self, id: &TaskId) -> Result<Slot> {
        self.inner
            .registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedError::UnknownTask(id.to_string()))
    }

    async fn snapshot(&self) -> Vec<(TaskId, Slot)> {
        self.inner
            .registry
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    // ─── Task records ─────────────────────────────────────────

    /// Register a one-off task. It becomes eligible once its start time has
    /// passed and its dependencies completed successfully.
    pub async fn submit(&self, principal: &Principal, spec: TaskSpec) -> Result<TaskId> {
        self.authorize(principal, Operation::Submit { kind: &spec.kind })?;
        if !self.inner.runnables.contains(&spec.kind) {
            return Err(SchedError::UnknownTaskKind(spec.kind));
        }
        self.register(spec, None).await
    }

    pub(crate) async fn register(
        &self,
        spec: TaskSpec,
        definition: Option<DefinitionId>,
    ) -> Result<TaskId> {
        let mut registry = self.inner.registry.write().await;
        let id = spec.id.clone().unwrap_or_else(TaskId::generate);
        if registry.contains_key(&id) {
            return Err(SchedError::DuplicateTask(id.to_string()));
        }
        if let Some(missing) = spec.dependencies.iter().find(|d| !registry.contains_key(*d)) {
            return Err(SchedError::UnknownDependency(missing.to_string()));
        }

        let mut record = TaskRecord::new(id.clone(), spec);
        if let Some(definition) = definition {
            record = record.with_recurring_definition(definition);
        }
        self.inner.store.save_task(&record)?;

        tracing::info!(
            "📅 Task scheduled: {} '{}' (start: {})",
            id,
            record.kind(),
            record
                .scheduled_start()
                .map_or_else(|| "now".to_string(), |t| t.to_rfc3339())
        );
        registry.insert(id.clone(), Arc::new(Mutex::new(record)));
        Ok(id)
    }

    pub async fn get(&self, id: &TaskId) -> Result<TaskRecord> {
        let slot = self.slot(id).await?;
        let record = slot.lock().await.clone();
        Ok(record)
    }

    pub(crate) async fn task_state(&self, id: &TaskId) -> Option<TaskState> {
        let slot = self.slot(id).await.ok()?;
        let state = slot.lock().await.state();
        Some(state)
    }

    /// Records matching `filter`, oldest first.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let mut records = Vec::new();
        for (_, slot) in self.snapshot().await {
            let record = slot.lock().await;
            if filter.matches(&record) {
                records.push(record.clone());
            }
        }
        records.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        records
    }

    /// Apply attribute, start-time or state changes. Returns the resulting state.
    pub async fn modify(
        &self,
        principal: &Principal,
        id: &TaskId,
        modification: TaskModification,
    ) -> Result<TaskState> {
        self.authorize(principal, Operation::Modify { task_id: id.as_str() })?;
        let slot = self.slot(id).await?;
        let mut record = slot.lock().await;
        policy::authorize_modification(record.state(), &modification).into_result()?;

        let before = record.clone();
        record.apply_changes(&modification);
        let effect = match modification.state {
            Some(RequestedState::Cancel) => Some(Self::begin_cancel(&mut record)?),
            _ => None,
        };
        self.persist(&mut record, before)?;

        let state = record.state();
        let finished = match effect {
            Some(effect) => self.complete_cancel(effect, &record).await,
            None => None,
        };
        drop(record);

        tracing::info!("✏️ Task modified: {id} ({state})");
        if let Some(finished) = finished {
            self.after_terminal(&finished).await;
        }
        Ok(state)
    }

    /// Cancel a task. A pending task ends as CANCELED_BEFORE_STARTING right
    /// away; a running task is asked to stop and stays RUNNING until its
    /// runnable returns.
    pub async fn cancel(&self, principal: &Principal, id: &TaskId) -> Result<TaskState> {
        self.authorize(principal, Operation::Cancel { task_id: id.as_str() })?;
        self.cancel_task(id).await
    }

    async fn cancel_task(&self, id: &TaskId) -> Result<TaskState> {
        let slot = self.slot(id).await?;
        let mut record = slot.lock().await;
        state::transition(record.state(), TaskEvent::Cancel)?;
        policy::authorize(record.state(), ChangeKind::Cancel).into_result()?;

        let before = record.clone();
        let effect = Self::begin_cancel(&mut record)?;
        self.persist(&mut record, before)?;

        let state = record.state();
        let finished = self.complete_cancel(effect, &record).await;
        drop(record);

        tracing::info!("🛑 Cancel requested for task {id}: {state}");
        if let Some(finished) = finished {
            self.after_terminal(&finished).await;
        }
        Ok(state)
    }

    fn begin_cancel(record: &mut TaskRecord) -> Result<CancelEffect> {
        if record.state().is_running() {
            record.request_stop(StopReason::Administrator);
            Ok(CancelEffect::StopRequested)
        } else {
            record.apply(TaskEvent::Cancel)?;
            Ok(CancelEffect::Canceled)
        }
    }

    /// Side effects of a persisted cancel. Returns the record when it is now terminal.
    async fn complete_cancel(&self, effect: CancelEffect, record: &TaskRecord) -> Option<TaskRecord> {
        match effect {
            CancelEffect::StopRequested => {
                if let Some(stop) = self.inner.active.lock().await.get(record.id()) {
                    stop.request_stop();
                }
                None
            }
            CancelEffect::Canceled => Some(record.clone()),
        }
    }

    /// Remove a task record. Running tasks cannot be deleted.
    pub async fn delete(&self, principal: &Principal, id: &TaskId) -> Result<()> {
        self.authorize(principal, Operation::Delete { task_id: id.as_str() })?;
        let mut registry = self.inner.registry.write().await;
        let slot = registry
            .get(id)
            .cloned()
            .ok_or_else(|| SchedError::UnknownTask(id.to_string()))?;
        let record = slot.lock().await;
        policy::authorize(record.state(), ChangeKind::Delete).into_result()?;
        self.inner.store.delete_task(id)?;
        registry.remove(id);

        let orphaned = !record.state().is_terminal() && record.recurring_definition().is_some();
        let snapshot = record.clone();
        drop(record);
        drop(registry);

        tracing::info!("🗑️ Task deleted: {id}");
        if orphaned {
            self.inner.recurring.iteration_ended(self, &snapshot).await;
        }
        Ok(())
    }

    /// Hold a pending task back from dispatch.
    pub async fn disable_task(&self, principal: &Principal, id: &TaskId) -> Result<TaskState> {
        self.authorize(principal, Operation::Modify { task_id: id.as_str() })?;
        self.apply_event(id, TaskEvent::Disable).await
    }

    /// Return a disabled task to WAITING_ON_START_TIME.
    pub async fn enable_task(&self, principal: &Principal, id: &TaskId) -> Result<TaskState> {
        self.authorize(principal, Operation::Modify { task_id: id.as_str() })?;
        self.apply_event(id, TaskEvent::Enable).await
    }

    async fn apply_event(&self, id: &TaskId, event: TaskEvent) -> Result<TaskState> {
        let slot = self.slot(id).await?;
        let mut record = slot.lock().await;
        let before = record.clone();
        let state = record.apply(event)?;
        self.persist(&mut record, before)?;
        tracing::info!("Task {id}: {event} -> {state}");
        Ok(state)
    }

    /// Delete terminal records that completed before `older_than`. Records some
    /// unfinished task still depends on are kept.
    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut registry = self.inner.registry.write().await;
        let mut needed = HashSet::new();
        let mut expired = Vec::new();
        for (id, slot) in registry.iter() {
            let record = slot.lock().await;
            if record.state().is_terminal() {
                if record
                    .completion()
                    .is_some_and(|c| c.completed_at < older_than)
                {
                    expired.push(id.clone());
                }
            } else {
                needed.extend(record.dependencies().iter().cloned());
            }
        }
        expired.retain(|id| !needed.contains(id));

        for id in &expired {
            self.inner.store.delete_task(id)?;
            registry.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!("🧹 Purged {} finished task(s)", expired.len());
        }
        Ok(expired.len())
    }

    // ─── Recurring definitions ───────────────────────────────

    pub async fn add_recurring(
        &self,
        principal: &Principal,
        spec: RecurringSpec,
    ) -> Result<DefinitionId> {
        self.authorize(principal, Operation::ManageRecurring { kind: &spec.kind })?;
        if !self.inner.runnables.contains(&spec.kind) {
            return Err(SchedError::UnknownTaskKind(spec.kind));
        }
        self.inner.recurring.create(self, spec).await
    }

    pub async fn modify_recurring(
        &self,
        principal: &Principal,
        id: &DefinitionId,
        modification: RecurringModification,
    ) -> Result<RecurringDefinition> {
        let definition = self.inner.recurring.get(id).await?;
        self.authorize(principal, Operation::ManageRecurring { kind: definition.kind() })?;
        self.inner.recurring.modify(self, id, &modification).await?;
        self.inner.recurring.get(id).await
    }

    /// Delete a definition and cancel its pending iteration.
    pub async fn delete_recurring(&self, principal: &Principal, id: &DefinitionId) -> Result<()> {
        let definition = self.inner.recurring.get(id).await?;
        self.authorize(principal, Operation::ManageRecurring { kind: definition.kind() })?;
        self.inner.recurring.delete(self, id).await
    }

    pub async fn disable_recurring(&self, principal: &Principal, id: &DefinitionId) -> Result<()> {
        let definition = self.inner.recurring.get(id).await?;
        self.authorize(principal, Operation::ManageRecurring { kind: definition.kind() })?;
        self.inner.recurring.disable(self, id).await
    }

    pub async fn enable_recurring(
        &self,
        principal: &Principal,
        id: &DefinitionId,
    ) -> Result<Option<TaskId>> {
        let definition = self.inner.recurring.get(id).await?;
        self.authorize(principal, Operation::ManageRecurring { kind: definition.kind() })?;
        self.inner.recurring.enable(self, id).await
    }

    /// Ensure the definition has its next iteration scheduled. Idempotent.
    pub async fn schedule_recurring(
        &self,
        principal: &Principal,
        id: &DefinitionId,
    ) -> Result<Option<TaskId>> {
        let definition = self.inner.recurring.get(id).await?;
        self.authorize(principal, Operation::ManageRecurring { kind: definition.kind() })?;
        self.inner.recurring.schedule(self, id).await
    }

    pub async fn get_recurring(&self, id: &DefinitionId) -> Result<RecurringDefinition> {
        self.inner.recurring.get(id).await
    }

    pub async fn list_recurring(&self) -> Vec<RecurringDefinition> {
        self.inner.recurring.list().await
    }

    /// Remove a pending iteration outright. Returns false if it is running.
    pub(crate) async fn retire_pending(&self, id: &TaskId) -> Result<bool> {
        let mut registry = self.inner.registry.write().await;
        let Some(slot) = registry.get(id).cloned() else {
            return Ok(true);
        };
        let record = slot.lock().await;
        if record.state().is_running() {
            return Ok(false);
        }
        if !record.state().is_terminal() {
            self.inner.store.delete_task(id)?;
            registry.remove(id);
            tracing::info!("🗑️ Pending iteration removed: {id}");
        }
        Ok(true)
    }

    pub(crate) async fn stop_iteration(&self, id: &TaskId) {
        if let Err(e) = self.cancel_task(id).await {
            tracing::warn!("⚠️ Could not stop iteration {id}: {e}");
        }
    }

    pub(crate) async fn cancel_pending_iteration(&self, id: &TaskId) {
        let pending = self
            .task_state(id)
            .await
            .is_some_and(|s| s.is_pending() || s.is_disabled());
        if pending && let Err(e) = self.cancel_task(id).await {
            tracing::warn!("⚠️ Could not cancel iteration {id}: {e}");
        }
    }

    // ─── Dispatch ─────────────────────────────────────────────

    /// Run one dispatch cycle: reclassify pending tasks, cancel tasks whose
    /// dependencies failed, and start eligible tasks while workers are free.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let _cycle = self.inner.cycle.lock().await;
        if self.inner.shutdown.is_cancelled() {
            report.skipped = true;
            return report;
        }
        if let Err(e) = self.inner.store.health_check() {
            tracing::warn!("⚠️ Store unavailable, skipping dispatch cycle: {e}");
            report.skipped = true;
            return report;
        }
        self.flush_unsaved().await;

        let now = Utc::now();
        let slots = self.snapshot().await;
        let mut states = HashMap::with_capacity(slots.len());
        let mut candidates = Vec::new();
        for (id, slot) in slots {
            let record = slot.lock().await;
            states.insert(id.clone(), record.state());
            if record.state().is_pending() {
                let key = record.scheduled_start().unwrap_or(record.created_at());
                drop(record);
                candidates.push((key, id, slot));
            }
        }
        // Earliest start first, so older work gets free workers first.
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut finished = Vec::new();
        for (_, id, slot) in candidates {
            let mut record = slot.lock().await;
            if !record.state().is_pending() {
                continue;
            }
            let before = record.clone();

            if !record.is_due(now) {
                self.reclassify(&mut record, before, WaitReason::StartTime);
                continue;
            }

            match dependency_status(&record, &states) {
                Dependencies::Satisfied => {}
                Dependencies::Waiting => {
                    self.reclassify(&mut record, before, WaitReason::Dependency);
                    self.note_backlog(&record, now, &mut report);
                    continue;
                }
                Dependencies::Failed(dependency) => {
                    if self.inner.config.dependency_failure == DependencyFailurePolicy::Wait {
                        self.reclassify(&mut record, before, WaitReason::Dependency);
                        self.note_backlog(&record, now, &mut report);
                        continue;
                    }
                    record.push_log(format!(
                        "Dependency {dependency} did not complete successfully"
                    ));
                    let canceled = record
                        .apply(TaskEvent::DependencyFailed)
                        .and_then(|_| self.persist(&mut record, before));
                    match canceled {
                        Ok(()) => {
                            tracing::info!("⛔ Task {id} canceled: dependency {dependency} failed");
                            report.canceled.push(id);
                            finished.push(record.clone());
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("⚠️ Could not cancel task {id}, retrying next cycle: {e}");
                            report.persist_failed = true;
                            break;
                        }
                    }
                }
            }

            let Some(runnable) = self.inner.runnables.get(record.kind()) else {
                tracing::warn!("⚠️ No runnable registered for kind '{}' (task {id})", record.kind());
                self.note_backlog(&record, now, &mut report);
                continue;
            };
            let Ok(permit) = self.inner.workers.clone().try_acquire_owned() else {
                self.note_backlog(&record, now, &mut report);
                continue;
            };

            if self.inner.shutdown.is_cancelled() {
                tracing::debug!("Shutdown requested, no further starts this cycle");
                break;
            }
            if let Err(e) = record.apply(TaskEvent::Start) {
                tracing::warn!("⚠️ Task {id} cannot start: {e}");
                continue;
            }
            if let Err(e) = self.persist(&mut record, before) {
                tracing::warn!("⚠️ Could not persist start of task {id}, retrying next cycle: {e}");
                report.persist_failed = true;
                break;
            }

            let stop = StopSignal::new();
            self.inner.active.lock().await.insert(id.clone(), stop.clone());
            let ctx = TaskContext {
                task_id: id.to_string(),
                kind: record.kind().to_string(),
                attributes: record.attributes().clone(),
                stop,
            };
            tracing::info!("🔔 Task started: {id} '{}'", record.kind());
            self.spawn_worker(id.clone(), runnable, ctx, permit);
            report.started.push(id);
        }

        for record in finished {
            self.after_terminal(&record).await;
        }

        if report.backlog > 0 {
            tracing::warn!(
                "⏳ {} task(s) overdue by more than {}s",
                report.backlog,
                self.inner.config.backlog_threshold_secs
            );
        }

        if self.inner.config.retention_secs > 0 {
            match now.checked_sub_signed(seconds(self.inner.config.retention_secs)) {
                Some(cutoff) => match self.purge(cutoff).await {
                    Ok(purged) => report.purged = purged,
                    Err(e) => tracing::warn!("⚠️ Retention purge failed: {e}"),
                },
                None => tracing::debug!("Retention period reaches past the calendar, nothing to purge"),
            }
        }
        report
    }

    fn reclassify(&self, record: &mut TaskRecord, before: TaskRecord, reason: WaitReason) {
        let target = match reason {
            WaitReason::StartTime => TaskState::WaitingOnStartTime,
            WaitReason::Dependency => TaskState::WaitingOnDependency,
        };
        if record.state() == target {
            return;
        }
        let changed = record
            .apply(TaskEvent::Wait(reason))
            .and_then(|_| self.persist(record, before));
        if let Err(e) = changed {
            tracing::warn!("⚠️ Could not reclassify task {}: {e}", record.id());
        }
    }

    fn is_overdue(&self, record: &TaskRecord, now: DateTime<Utc>) -> bool {
        let since = record.scheduled_start().unwrap_or(record.created_at());
        now - since > seconds(self.inner.config.backlog_threshold_secs)
    }

    fn note_backlog(&self, record: &TaskRecord, now: DateTime<Utc>, report: &mut TickReport) {
        if self.is_overdue(record, now) {
            tracing::debug!("Task {} is overdue ({})", record.id(), record.state());
            report.backlog += 1;
        }
    }

    fn spawn_worker(
        &self,
        id: TaskId,
        runnable: Arc<dyn Runnable>,
        ctx: TaskContext,
        permit: OwnedSemaphorePermit,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let run = tokio::spawn(async move { runnable.execute(ctx).await });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("💥 Task {id} failed abnormally: {e}");
                    TaskOutcome::error(format!("runnable failed: {e}"))
                }
            };
            scheduler.finish_run(&id, outcome).await;
        });
    }

    /// Record the end of a run. A requested stop decides the final state,
    /// whatever the runnable reported.
    async fn finish_run(&self, id: &TaskId, outcome: TaskOutcome) {
        let mut finished = None;
        if let Ok(slot) = self.slot(id).await {
            let mut record = slot.lock().await;
            if !record.state().is_running() {
                tracing::debug!("Task {id} already ended as {}, ignoring result", record.state());
            } else {
                let event = record
                    .stop_requested()
                    .map_or(TaskEvent::Complete(outcome.code), TaskEvent::from);
                match record.apply_with_outcome(event, Some(&outcome)) {
                    Ok(state) => {
                        if let Err(e) = self.inner.store.save_task(&record) {
                            tracing::warn!("⚠️ Could not persist end of task {id}, will retry: {e}");
                            self.inner.unsaved.lock().await.insert(id.clone());
                        }
                        let emoji = if state.is_successful() { "✅" } else { "⚠️" };
                        tracing::info!("{emoji} Task finished: {id} ({state})");
                        finished = Some(record.clone());
                    }
                    Err(e) => tracing::warn!("⚠️ Task {id}: {e}"),
                }
            }
        }

        self.inner.active.lock().await.remove(id);
        if let Some(record) = finished {
            self.after_terminal(&record).await;
        }
    }

    /// Retry saves that failed when a run ended.
    async fn flush_unsaved(&self) {
        let ids = std::mem::take(&mut *self.inner.unsaved.lock().await);
        let mut still_unsaved = Vec::new();
        for id in ids {
            let Ok(slot) = self.slot(&id).await else {
                continue;
            };
            let saved = self.inner.store.save_task(&*slot.lock().await);
            if saved.is_err() {
                still_unsaved.push(id);
            }
        }
        if !still_unsaved.is_empty() {
            self.inner.unsaved.lock().await.extend(still_unsaved);
        }
    }

    /// Notifications and recurrence for a record that just became terminal.
    async fn after_terminal(&self, record: &TaskRecord) {
        let notification = Notification::for_record(record);
        let targets = NotifyRouter::targets_for(record);
        self.inner.notifier.lock().await.record(notification.clone());

        if !targets.is_empty() {
            let client = self.inner.http.clone();
            let timeout = Duration::from_secs(self.inner.notify_config.webhook_timeout_secs);
            tokio::spawn(async move {
                let results = dispatch::dispatch_all(&client, &notification, &targets, timeout).await;
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!("⚠️ Notification for task {} failed: {e}", notification.task_id);
                    }
                }
            });
        }

        if record.recurring_definition().is_some() {
            self.inner.recurring.iteration_ended(self, record).await;
        }
    }

    /// Completion notifications built so far, oldest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.notifier.lock().await.history().to_vec()
    }

    // ─── Lifecycle ────────────────────────────────────────────

    /// Dispatch loop. Returns once [`Scheduler::shutdown`] is called.
    pub async fn run(&self) {
        let period = Duration::from_millis(self.inner.config.tick_interval_ms.max(1));
        tracing::info!(
            "⏰ Scheduler started (tick every {}ms, {} workers)",
            period.as_millis(),
            self.inner.config.max_workers
        );
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        tracing::info!("⏹️ Dispatch loop stopped");
    }

    /// Run the dispatch loop on a background tokio task.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn running_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// Stop dispatching, ask every running task to stop, and wait up to the
    /// grace period. Tasks still running afterwards are recorded as
    /// STOPPED_BY_SHUTDOWN. Returns how many had to be forced.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        // A cycle already in progress may still have started tasks.
        drop(self.inner.cycle.lock().await);
        let running: Vec<(TaskId, StopSignal)> = self
            .inner
            .active
            .lock()
            .await
            .iter()
            .map(|(id, stop)| (id.clone(), stop.clone()))
            .collect();
        tracing::info!("🛑 Shutting down: stopping {} running task(s)", running.len());

        for (id, stop) in &running {
            if let Ok(slot) = self.slot(id).await {
                let mut record = slot.lock().await;
                if record.state().is_running() {
                    record.request_stop(StopReason::Shutdown);
                    if let Err(e) = self.inner.store.save_task(&record) {
                        tracing::warn!("⚠️ Could not persist stop request for {id}: {e}");
                    }
                }
            }
            stop.request_stop();
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.inner.config.shutdown_grace_secs);
        while self.running_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let stragglers: Vec<TaskId> = self.inner.active.lock().await.keys().cloned().collect();
        let mut forced = Vec::new();
        for id in &stragglers {
            let Ok(slot) = self.slot(id).await else {
                continue;
            };
            let mut record = slot.lock().await;
            if record.state().is_running() && record.apply(TaskEvent::Shutdown).is_ok() {
                record.push_log("Did not stop within the shutdown grace period".to_string());
                if let Err(e) = self.inner.store.save_task(&record) {
                    tracing::warn!("⚠️ Could not persist shutdown of task {id}: {e}");
                }
                tracing::warn!("⚠️ Task {id} did not stop in time, marked {}", record.state());
                forced.push(record.clone());
            }
        }
        let count = forced.len();
        for record in forced {
            self.after_terminal(&record).await;
        }
        self.flush_unsaved().await;
        tracing::info!("👋 Scheduler stopped");
        count
    }

    /// Rebuild the registry from the store after a restart. Tasks that were
    /// RUNNING become STOPPED_BY_SHUTDOWN; overdue pending tasks start on
    /// the next cycle; each enabled definition gets a live iteration.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let tasks = self.inner.store.load_tasks()?;
        let definitions = self.inner.store.load_definitions()?;
        let mut report = RecoveryReport {
            tasks: tasks.len(),
            definitions: definitions.len(),
            ..Default::default()
        };

        let mut live = HashMap::new();
        {
            let mut registry = self.inner.registry.write().await;
            for mut record in tasks {
                if record.state().is_running() {
                    record.apply(TaskEvent::Shutdown)?;
                    record.push_log("Interrupted by server restart".to_string());
                    self.inner.store.save_task(&record)?;
                    tracing::warn!("⚠️ Task {} was running at shutdown, marked {}", record.id(), record.state());
                    report.interrupted += 1;
                }
                if !record.state().is_terminal()
                    && let Some(definition) = record.recurring_definition()
                {
                    live.insert(definition.clone(), record.id().clone());
                }
                registry.insert(record.id().clone(), Arc::new(Mutex::new(record)));
            }
        }

        report.rescheduled = self.inner.recurring.recover(self, definitions, &live).await;
        tracing::info!(
            "♻️ Recovered {} task(s), {} recurring definition(s), {} interrupted",
            report.tasks,
            report.definitions,
            report.interrupted
        );
        Ok(report)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let max_workers = self.inner.config.max_workers.max(1);
        let mut stats = SchedulerStats {
            max_workers,
            busy_workers: max_workers.saturating_sub(self.inner.workers.available_permits()),
            recurring_definitions: self.inner.recurring.list().await.len(),
            ..Default::default()
        };
        let now = Utc::now();
        for (_, slot) in self.snapshot().await {
            let record = slot.lock().await;
            let state = record.state();
            if StateClass::of(state) == StateClass::Pending && self.is_overdue(&record, now) {
                stats.backlog += 1;
            }
            drop(record);
            stats.total += 1;
            let counter = match state {
                TaskState::WaitingOnStartTime => &mut stats.waiting_on_start_time,
                TaskState::WaitingOnDependency => &mut stats.waiting_on_dependency,
                TaskState::Disabled => &mut stats.disabled,
                TaskState::Running => &mut stats.running,
                TaskState::CompletedSuccessfully => &mut stats.completed_successfully,
                TaskState::CompletedWithErrors => &mut stats.completed_with_errors,
                TaskState::CanceledBeforeStarting => &mut stats.canceled_before_starting,
                TaskState::StoppedByAdministrator => &mut stats.stopped_by_administrator,
                TaskState::StoppedByShutdown => &mut stats.stopped_by_shutdown,
            };
            *counter += 1;
        }
        stats
    }
}

fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Only a successful completion satisfies a dependency. A dependency that
/// ended any other way, or was deleted, has failed.
fn dependency_status(record: &TaskRecord, states: &HashMap<TaskId, TaskState>) -> Dependencies {
    let mut waiting = false;
    for dependency in record.dependencies() {
        match states.get(dependency) {
            Some(state) if state.is_successful() => {}
            Some(state) if !state.is_terminal() => waiting = true,
            _ => return Dependencies::Failed(dependency.clone()),
        }
    }
    if waiting {
        Dependencies::Waiting
    } else {
        Dependencies::Satisfied
    }
}
