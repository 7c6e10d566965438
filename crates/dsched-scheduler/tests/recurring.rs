//! Recurring task definitions: creation, iteration bookkeeping, modification,
//! disable/enable, deletion and recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dsched_core::error::{AdminResultCode, SchedError};
use dsched_core::traits::authorizer::Principal;
use dsched_scheduler::{
    DefinitionId, MemoryStore, RecurrenceRule, RecurringModification, RecurringSpec, Scheduler,
    StateClass, TaskFilter, TaskId, TaskModification, TaskRecord, TaskState, TaskStore,
};

fn admin() -> Principal {
    Principal::new("cn=Directory Manager")
}

async fn iterations(s: &Scheduler, id: &DefinitionId, class: StateClass) -> Vec<TaskRecord> {
    let filter = TaskFilter {
        class: Some(class),
        ..TaskFilter::for_definition(id)
    };
    s.list(&filter).await
}

/// Make the current iteration due now and start it with an explicit cycle.
async fn start_iteration(s: &Scheduler, id: &DefinitionId) -> TaskId {
    let iteration = iterations(s, id, StateClass::Pending).await.remove(0);
    s.modify(&admin(), iteration.id(), TaskModification::new().reschedule(None))
        .await
        .unwrap();
    assert_eq!(s.tick().await.started, vec![iteration.id().clone()]);
    iteration.id().clone()
}

/// Poll until the definition has a pending iteration other than `previous`.
async fn next_iteration(s: &Scheduler, id: &DefinitionId, previous: &TaskId) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let pending = iterations(s, id, StateClass::Pending).await;
        if let Some(next) = pending.into_iter().find(|r| r.id() != previous) {
            return next;
        }
        assert!(tokio::time::Instant::now() < deadline, "no new iteration of {id}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_definition_keeps_one_pending_iteration() {
    let s = Scheduler::builder().build();
    let id = s
        .add_recurring(
            &admin(),
            RecurringSpec::new("sleep", "* * * * *").with_id("every-minute"),
        )
        .await
        .unwrap();

    let pending = iterations(&s, &id, StateClass::Pending).await;
    assert_eq!(pending.len(), 1);
    let start = pending[0].scheduled_start().unwrap();
    assert!(start > Utc::now());
    assert!(RecurrenceRule::parse("* * * * *").unwrap().matches(start));

    // Asking again changes nothing.
    let again = s.schedule_recurring(&admin(), &id).await.unwrap();
    assert_eq!(again.as_ref(), Some(pending[0].id()));
    assert_eq!(iterations(&s, &id, StateClass::Pending).await.len(), 1);

    let definition = s.get_recurring(&id).await.unwrap();
    assert_eq!(definition.active_iteration(), Some(pending[0].id()));
    assert_eq!(definition.iterations(), 1);
}

#[tokio::test]
async fn test_ended_iteration_schedules_the_next_one() {
    let s = Scheduler::builder().build();
    let id = s
        .add_recurring(&admin(), RecurringSpec::new("sleep", "*/5 * * * *"))
        .await
        .unwrap();
    let first = iterations(&s, &id, StateClass::Pending).await.remove(0);

    s.cancel(&admin(), first.id()).await.unwrap();

    let pending = iterations(&s, &id, StateClass::Pending).await;
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id(), first.id());
    assert!(pending[0].scheduled_start() > first.scheduled_start());
    assert_eq!(
        s.get(first.id()).await.unwrap().state(),
        TaskState::CanceledBeforeStarting
    );
}

#[tokio::test]
async fn test_finished_iteration_schedules_the_next_one() {
    for (sleep_ms, outcome) in [
        ("10", TaskState::CompletedSuccessfully),
        ("soon", TaskState::CompletedWithErrors),
    ] {
        let s = Scheduler::builder().build();
        let id = s
            .add_recurring(
                &admin(),
                RecurringSpec::new("sleep", "* * * * *").attribute("sleep-ms", sleep_ms),
            )
            .await
            .unwrap();
        let first = start_iteration(&s, &id).await;

        let next = next_iteration(&s, &id, &first).await;
        let ended = s.get(&first).await.unwrap();
        assert_eq!(ended.state(), outcome);
        assert!(next.scheduled_start().unwrap() > ended.actual_start().unwrap());
        assert_eq!(iterations(&s, &id, StateClass::Pending).await.len(), 1);

        let definition = s.get_recurring(&id).await.unwrap();
        assert_eq!(definition.active_iteration(), Some(next.id()));
        assert_eq!(definition.iterations(), 2);
    }
}

#[tokio::test]
async fn test_disabled_while_running_schedules_nothing() {
    let s = Scheduler::builder().build();
    let id = s
        .add_recurring(
            &admin(),
            RecurringSpec::new("sleep", "* * * * *").attribute("sleep-ms", "200"),
        )
        .await
        .unwrap();
    let running = start_iteration(&s, &id).await;

    s.disable_recurring(&admin(), &id).await.unwrap();
    assert!(s.get(&running).await.unwrap().state().is_running());

    // The run finishes normally; the definition then drops its iteration.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while s.get_recurring(&id).await.unwrap().active_iteration().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "iteration never ended");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        s.get(&running).await.unwrap().state(),
        TaskState::CompletedSuccessfully
    );
    assert!(iterations(&s, &id, StateClass::Pending).await.is_empty());
    assert_eq!(s.list(&TaskFilter::for_definition(&id)).await.len(), 1);
    assert_eq!(s.get_recurring(&id).await.unwrap().iterations(), 1);
}

#[tokio::test]
async fn test_delete_definition_removes_pending_iteration() {
    let s = Scheduler::builder().build();
    let before = s.list(&TaskFilter::all()).await.len();
    let id = s
        .add_recurring(&admin(), RecurringSpec::new("sleep", "0 3 * * *"))
        .await
        .unwrap();
    assert_eq!(s.list(&TaskFilter::all()).await.len(), before + 1);

    s.delete_recurring(&admin(), &id).await.unwrap();
    assert_eq!(s.list(&TaskFilter::all()).await.len(), before);
    let err = s.get_recurring(&id).await.unwrap_err();
    assert_eq!(err.result_code(), AdminResultCode::NoSuchObject);
}

#[tokio::test]
async fn test_impossible_schedule_is_rejected() {
    let s = Scheduler::builder().build();
    let err = s
        .add_recurring(&admin(), RecurringSpec::new("sleep", "* * 31 2 *"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::NoOccurrence { .. }));
    assert!(s.list_recurring().await.is_empty());
    assert!(s.list(&TaskFilter::all()).await.is_empty());

    let err = s
        .add_recurring(&admin(), RecurringSpec::new("sleep", "60 * * * *"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::Parse(_)));
    assert_eq!(err.result_code(), AdminResultCode::InvalidAttributeSyntax);
}

#[tokio::test]
async fn test_modify_schedule() {
    let s = Scheduler::builder().build();
    let id = s
        .add_recurring(&admin(), RecurringSpec::new("sleep", "0 3 * * *"))
        .await
        .unwrap();
    let original = iterations(&s, &id, StateClass::Pending).await.remove(0);

    let err = s
        .modify_recurring(&admin(), &id, RecurringModification::new().schedule("0 25 * * *"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::Parse(_)));
    assert_eq!(
        s.get_recurring(&id).await.unwrap().schedule().expression(),
        "0 3 * * *"
    );

    let updated = s
        .modify_recurring(
            &admin(),
            &id,
            RecurringModification::new()
                .schedule("30 4 * * *")
                .replace("description", "later"),
        )
        .await
        .unwrap();
    assert_eq!(updated.schedule().expression(), "30 4 * * *");
    assert_eq!(updated.attributes()["description"], vec!["later".to_string()]);

    let pending = iterations(&s, &id, StateClass::Pending).await;
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id(), original.id());
    assert!(updated.schedule().matches(pending[0].scheduled_start().unwrap()));
    assert!(s.get(original.id()).await.is_err());
}

#[tokio::test]
async fn test_disable_and_enable_definition() {
    let s = Scheduler::builder().build();
    let id = s
        .add_recurring(&admin(), RecurringSpec::new("sleep", "15 * * * *"))
        .await
        .unwrap();
    let first = iterations(&s, &id, StateClass::Pending).await.remove(0);

    s.disable_recurring(&admin(), &id).await.unwrap();
    assert_eq!(
        s.get(first.id()).await.unwrap().state(),
        TaskState::CanceledBeforeStarting
    );
    assert!(iterations(&s, &id, StateClass::Pending).await.is_empty());
    let definition = s.get_recurring(&id).await.unwrap();
    assert!(!definition.is_enabled());
    assert!(definition.active_iteration().is_none());

    let next = s.enable_recurring(&admin(), &id).await.unwrap();
    let pending = iterations(&s, &id, StateClass::Pending).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(next.as_ref(), Some(pending[0].id()));
}

#[tokio::test]
async fn test_recovery_restores_missing_iteration() {
    let store = Arc::new(MemoryStore::new());
    let id = {
        let s = Scheduler::builder().store(store.clone()).build();
        let id = s
            .add_recurring(&admin(), RecurringSpec::new("sleep", "0 12 * * *"))
            .await
            .unwrap();
        // Lose the iteration, as if the server died before writing it.
        let pending = iterations(&s, &id, StateClass::Pending).await.remove(0);
        store.delete_task(pending.id()).unwrap();
        id
    };

    let s = Scheduler::builder().store(store.clone()).build();
    let report = s.recover().await.unwrap();
    assert_eq!(report.definitions, 1);
    assert_eq!(report.rescheduled, 1);
    assert_eq!(iterations(&s, &id, StateClass::Pending).await.len(), 1);

    // A second restart finds the iteration and schedules nothing new.
    let s = Scheduler::builder().store(store).build();
    let report = s.recover().await.unwrap();
    assert_eq!(report.rescheduled, 0);
    assert_eq!(iterations(&s, &id, StateClass::Pending).await.len(), 1);
}
