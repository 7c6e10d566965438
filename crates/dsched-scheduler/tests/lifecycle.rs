//! End-to-end task lifecycle tests: submission, dispatch, dependencies,
//! cancellation, deletion, shutdown and recovery, driven through the
//! scheduler's administrative surface.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dsched_core::config::{PrincipalConfig, SchedulerConfig, SecurityConfig};
use dsched_core::error::{AdminResultCode, DenyReason, SchedError};
use dsched_core::traits::authorizer::Principal;
use dsched_core::traits::runnable::{Runnable, TaskContext, TaskOutcome};
use dsched_scheduler::{
    DefinitionId, MemoryStore, RecurringDefinition, Scheduler, SqliteStore, StateClass, TaskFilter,
    TaskId, TaskModification, TaskRecord, TaskSpec, TaskState, TaskStore,
};
use dsched_security::{MANAGE_TASKS, PrivilegeAuthorizer};
use tokio::sync::Mutex;

/// Appends its task id to a shared journal, then succeeds.
struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Runnable for Journal {
    fn kind(&self) -> &str {
        "journal"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.entries.lock().await.push(ctx.task_id.clone());
        TaskOutcome::success()
    }
}

/// Always reports an error.
struct Failing;

#[async_trait]
impl Runnable for Failing {
    fn kind(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _ctx: TaskContext) -> TaskOutcome {
        TaskOutcome::error("backend offline")
    }
}

/// Panics instead of returning.
struct Exploding;

#[async_trait]
impl Runnable for Exploding {
    fn kind(&self) -> &str {
        "exploding"
    }

    async fn execute(&self, _ctx: TaskContext) -> TaskOutcome {
        panic!("boom");
    }
}

/// Runs for `stubborn-ms` and never looks at its stop signal.
struct Stubborn;

#[async_trait]
impl Runnable for Stubborn {
    fn kind(&self) -> &str {
        "stubborn"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let ms = ctx
            .attribute("stubborn-ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        TaskOutcome::success()
    }
}

/// Memory store whose task writes take a while, so a dispatch cycle over
/// many tasks is still in progress when other calls arrive.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl TaskStore for SlowStore {
    fn save_task(&self, record: &TaskRecord) -> dsched_core::Result<()> {
        std::thread::sleep(self.delay);
        self.inner.save_task(record)
    }

    fn delete_task(&self, id: &TaskId) -> dsched_core::Result<()> {
        self.inner.delete_task(id)
    }

    fn load_tasks(&self) -> dsched_core::Result<Vec<TaskRecord>> {
        self.inner.load_tasks()
    }

    fn save_definition(&self, definition: &RecurringDefinition) -> dsched_core::Result<()> {
        self.inner.save_definition(definition)
    }

    fn delete_definition(&self, id: &DefinitionId) -> dsched_core::Result<()> {
        self.inner.delete_definition(id)
    }

    fn load_definitions(&self) -> dsched_core::Result<Vec<RecurringDefinition>> {
        self.inner.load_definitions()
    }
}

fn admin() -> Principal {
    Principal::new("cn=Directory Manager")
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 20,
        shutdown_grace_secs: 2,
        ..Default::default()
    }
}

fn scheduler_with(config: SchedulerConfig, store: Arc<dyn TaskStore>) -> Scheduler {
    Scheduler::builder()
        .config(config)
        .store(store)
        .runnable(Arc::new(Failing))
        .runnable(Arc::new(Exploding))
        .runnable(Arc::new(Stubborn))
        .build()
}

fn scheduler() -> Scheduler {
    scheduler_with(fast_config(), Arc::new(MemoryStore::new()))
}

/// Poll until the task satisfies `done`, or give up after five seconds.
async fn wait_for(
    scheduler: &Scheduler,
    id: &TaskId,
    done: impl Fn(TaskState) -> bool,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = scheduler.get(id).await.unwrap();
        if done(record.state()) || tokio::time::Instant::now() > deadline {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pending_task_can_be_modified_canceled_and_deleted() {
    let s = scheduler();
    let later = Utc::now() + chrono::Duration::days(1);
    let id = s
        .submit(
            &admin(),
            TaskSpec::new("sleep")
                .starting_at(later)
                .attribute("description", "nightly export"),
        )
        .await
        .unwrap();

    let state = s
        .modify(&admin(), &id, TaskModification::new().replace("description", "foo"))
        .await
        .unwrap();
    assert!(state.is_pending());
    assert_eq!(
        s.get(&id).await.unwrap().attributes()["description"],
        vec!["foo".to_string()]
    );

    let state = s
        .modify(&admin(), &id, TaskModification::new().set_state("cancel"))
        .await
        .unwrap();
    assert_eq!(state, TaskState::CanceledBeforeStarting);
    let record = s.get(&id).await.unwrap();
    assert!(record.completion().is_some());
    assert!(record.actual_start().is_none());

    s.delete(&admin(), &id).await.unwrap();
    assert!(s.list(&TaskFilter::all()).await.is_empty());
}

#[tokio::test]
async fn test_pending_state_change_other_than_cancel_is_refused() {
    let s = scheduler();
    let later = Utc::now() + chrono::Duration::days(1);
    let id = s
        .submit(&admin(), TaskSpec::new("sleep").starting_at(later))
        .await
        .unwrap();
    let err = s
        .modify(&admin(), &id, TaskModification::new().set_state("completed_successfully"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedError::MutationDenied(DenyReason::StateChangeNotAllowed)
    ));
}

#[tokio::test]
async fn test_running_task_rules() {
    let s = scheduler();
    let handle = s.spawn();
    let id = s
        .submit(&admin(), TaskSpec::new("sleep").attribute("sleep-ms", "60000"))
        .await
        .unwrap();
    let record = wait_for(&s, &id, TaskState::is_running).await;
    assert!(record.state().is_running());
    assert!(record.actual_start().is_some());

    let err = s.delete(&admin(), &id).await.unwrap_err();
    assert!(err.is_task_in_use());
    assert_eq!(err.result_code(), AdminResultCode::UnwillingToPerform);

    let err = s
        .modify(&admin(), &id, TaskModification::new().replace("description", "foo"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::MutationDenied(DenyReason::TaskRunning)));

    let state = s
        .modify(&admin(), &id, TaskModification::cancel())
        .await
        .unwrap();
    assert_eq!(state, TaskState::Running);

    let record = wait_for(&s, &id, TaskState::is_terminal).await;
    assert_eq!(record.state(), TaskState::StoppedByAdministrator);
    let completion = record.completion().unwrap();
    assert!(completion.completed_at - record.actual_start().unwrap() < chrono::Duration::seconds(10));

    s.delete(&admin(), &id).await.unwrap();
    s.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_repeated_cancel_of_running_task() {
    let s = scheduler();
    let handle = s.spawn();
    let id = s
        .submit(&admin(), TaskSpec::new("stubborn").attribute("stubborn-ms", "400"))
        .await
        .unwrap();
    wait_for(&s, &id, TaskState::is_running).await;

    assert_eq!(s.cancel(&admin(), &id).await.unwrap(), TaskState::Running);
    assert_eq!(s.cancel(&admin(), &id).await.unwrap(), TaskState::Running);

    // The runnable ignores the stop, but the requested stop still decides the outcome.
    let record = wait_for(&s, &id, TaskState::is_terminal).await;
    assert_eq!(record.state(), TaskState::StoppedByAdministrator);

    let err = s.cancel(&admin(), &id).await.unwrap_err();
    assert!(matches!(err, SchedError::InvalidTransition { .. }));
    s.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_dependency_runs_after_its_dependency() {
    let entries = Arc::new(Mutex::new(Vec::new()));
    let s = Scheduler::builder()
        .config(fast_config())
        .runnable(Arc::new(Journal {
            entries: entries.clone(),
        }))
        .build();
    let handle = s.spawn();

    let first = s
        .submit(&admin(), TaskSpec::new("journal").with_id("first"))
        .await
        .unwrap();
    let second = s
        .submit(
            &admin(),
            TaskSpec::new("journal").with_id("second").depends_on(first.clone()),
        )
        .await
        .unwrap();

    let done = wait_for(&s, &second, TaskState::is_terminal).await;
    assert_eq!(done.state(), TaskState::CompletedSuccessfully);
    let first = s.get(&first).await.unwrap();
    assert!(done.actual_start().unwrap() >= first.completion().unwrap().completed_at);
    assert_eq!(*entries.lock().await, vec!["first".to_string(), "second".to_string()]);

    s.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_failed_dependency_cancels_dependent() {
    let s = scheduler();
    let handle = s.spawn();
    let first = s.submit(&admin(), TaskSpec::new("failing")).await.unwrap();
    let second = s
        .submit(&admin(), TaskSpec::new("sleep").depends_on(first.clone()))
        .await
        .unwrap();

    let failed = wait_for(&s, &first, TaskState::is_terminal).await;
    assert_eq!(failed.state(), TaskState::CompletedWithErrors);
    assert_eq!(
        failed.completion().unwrap().details.as_deref(),
        Some("backend offline")
    );

    let dependent = wait_for(&s, &second, TaskState::is_terminal).await;
    assert_eq!(dependent.state(), TaskState::CanceledBeforeStarting);
    assert!(dependent.actual_start().is_none());
    s.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_panicking_runnable_completes_with_errors() {
    let s = scheduler();
    let handle = s.spawn();
    let id = s.submit(&admin(), TaskSpec::new("exploding")).await.unwrap();
    let record = wait_for(&s, &id, TaskState::is_terminal).await;
    assert_eq!(record.state(), TaskState::CompletedWithErrors);

    // The pool survives: later tasks still run.
    let next = s.submit(&admin(), TaskSpec::new("sleep")).await.unwrap();
    let record = wait_for(&s, &next, TaskState::is_terminal).await;
    assert_eq!(record.state(), TaskState::CompletedSuccessfully);
    s.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let config = SchedulerConfig {
        max_workers: 1,
        ..fast_config()
    };
    let s = scheduler_with(config, Arc::new(MemoryStore::new()));
    let a = s
        .submit(&admin(), TaskSpec::new("sleep").attribute("sleep-ms", "60000"))
        .await
        .unwrap();
    let b = s
        .submit(&admin(), TaskSpec::new("sleep").attribute("sleep-ms", "60000"))
        .await
        .unwrap();

    let report = s.tick().await;
    assert_eq!(report.started, vec![a.clone()]);
    assert!(s.get(&b).await.unwrap().state().is_pending());
    assert!(s.tick().await.started.is_empty());
    assert_eq!(s.stats().await.busy_workers, 1);

    s.cancel(&admin(), &a).await.unwrap();
    wait_for(&s, &a, TaskState::is_terminal).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while s.tick().await.started.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(s.get(&b).await.unwrap().state().is_running());
    s.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_running_tasks() {
    let config = SchedulerConfig {
        shutdown_grace_secs: 0,
        ..fast_config()
    };
    let s = scheduler_with(config, Arc::new(MemoryStore::new()));
    let cooperative = s
        .submit(&admin(), TaskSpec::new("sleep").attribute("sleep-ms", "60000"))
        .await
        .unwrap();
    let stubborn = s
        .submit(&admin(), TaskSpec::new("stubborn").attribute("stubborn-ms", "2000"))
        .await
        .unwrap();
    let later = Utc::now() + chrono::Duration::days(1);
    let pending = s
        .submit(&admin(), TaskSpec::new("sleep").starting_at(later))
        .await
        .unwrap();

    assert_eq!(s.tick().await.started.len(), 2);
    let forced = s.shutdown().await;
    assert!(forced >= 1);

    assert_eq!(
        s.get(&stubborn).await.unwrap().state(),
        TaskState::StoppedByShutdown
    );
    let record = wait_for(&s, &cooperative, TaskState::is_terminal).await;
    assert_eq!(record.state(), TaskState::StoppedByShutdown);
    assert!(s.get(&pending).await.unwrap().state().is_pending());
    assert!(s.tick().await.skipped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_during_dispatch_cycle() {
    let config = SchedulerConfig {
        max_workers: 8,
        ..fast_config()
    };
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(60),
    });
    let s = scheduler_with(config, store);
    let mut ids = Vec::new();
    for _ in 0..8 {
        let spec = TaskSpec::new("sleep").attribute("sleep-ms", "60000");
        ids.push(s.submit(&admin(), spec).await.unwrap());
    }

    let cycle = tokio::spawn({
        let s = s.clone();
        async move { s.tick().await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    let forced = s.shutdown().await;
    let report = cycle.await.unwrap();

    // Every task the cycle started was told to stop and honoured it.
    assert_eq!(forced, 0);
    assert!(!report.started.is_empty());
    assert!(report.started.len() < ids.len());
    for id in &report.started {
        let record = wait_for(&s, id, TaskState::is_terminal).await;
        assert_eq!(record.state(), TaskState::StoppedByShutdown);
        assert_eq!(
            record.completion().unwrap().details.as_deref(),
            Some("interrupted")
        );
    }
    for id in ids.iter().filter(|id| !report.started.contains(id)) {
        assert!(s.get(id).await.unwrap().state().is_pending());
    }
    assert!(s.list(&TaskFilter::in_class(StateClass::Running)).await.is_empty());
}

#[tokio::test]
async fn test_recovery_after_restart() {
    let path = std::env::temp_dir().join(format!("dsched-recovery-{}.db", uuid_suffix()));
    std::fs::remove_file(&path).ok();

    let later = Utc::now() + chrono::Duration::days(1);
    {
        let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let s = scheduler_with(fast_config(), store.clone());
        s.submit(
            &admin(),
            TaskSpec::new("sleep").with_id("future").starting_at(later),
        )
        .await
        .unwrap();
        s.submit(&admin(), TaskSpec::new("sleep").with_id("overdue").starting_at(Utc::now()))
            .await
            .unwrap();

        // Simulate a crash in the middle of a run.
        let mut running = TaskRecord::new(TaskId::new("interrupted"), TaskSpec::new("sleep"));
        running.apply(dsched_scheduler::TaskEvent::Start).unwrap();
        store.save_task(&running).unwrap();
    }

    let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let s = scheduler_with(fast_config(), store);
    let report = s.recover().await.unwrap();
    assert_eq!(report.tasks, 3);
    assert_eq!(report.interrupted, 1);

    assert_eq!(
        s.get(&TaskId::new("interrupted")).await.unwrap().state(),
        TaskState::StoppedByShutdown
    );
    let future = s.get(&TaskId::new("future")).await.unwrap();
    assert!(future.state().is_pending());
    assert_eq!(future.scheduled_start(), Some(later));

    let report = s.tick().await;
    assert_eq!(report.started, vec![TaskId::new("overdue")]);
    s.shutdown().await;
    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_privileges_are_enforced() {
    let config = SecurityConfig {
        enforce: true,
        principals: vec![PrincipalConfig {
            name: "cn=operator".into(),
            privileges: vec![MANAGE_TASKS.into()],
        }],
        ..Default::default()
    };
    let s = Scheduler::builder()
        .authorizer(Arc::new(PrivilegeAuthorizer::new(&config)))
        .build();

    let err = s
        .submit(&Principal::new("cn=nobody"), TaskSpec::new("sleep"))
        .await
        .unwrap_err();
    assert_eq!(err.result_code(), AdminResultCode::InsufficientAccessRights);

    let operator = Principal::new("cn=operator");
    let id = s.submit(&operator, TaskSpec::new("sleep")).await.unwrap();
    let err = s.delete(&Principal::new("cn=nobody"), &id).await.unwrap_err();
    assert!(matches!(err, SchedError::Unauthorized(_)));
    assert_eq!(
        s.list(&TaskFilter::in_class(StateClass::Pending)).await.len(),
        1
    );
}

#[tokio::test]
async fn test_completion_notifications() {
    let s = scheduler();
    let handle = s.spawn();
    let id = s
        .submit(
            &admin(),
            TaskSpec::new("failing")
                .notify_on_completion("log")
                .notify_on_error("log"),
        )
        .await
        .unwrap();
    wait_for(&s, &id, TaskState::is_terminal).await;

    let notifications = s.notifications().await;
    let sent = notifications.iter().find(|n| n.task_id == id).unwrap();
    assert_eq!(sent.state, TaskState::CompletedWithErrors);
    s.shutdown().await;
    handle.await.unwrap();
}

fn uuid_suffix() -> String {
    TaskId::generate().to_string()
}
