//! Built-in task kinds.

use std::time::Duration;

use async_trait::async_trait;
use dsched_core::traits::runnable::{Runnable, TaskContext, TaskOutcome};

/// Sleeps for `sleep-ms` milliseconds (default 0), returning early when a
/// stop is requested. Useful for exercising dependencies and cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepTask;

pub const SLEEP_MS: &str = "sleep-ms";

#[async_trait]
impl Runnable for SleepTask {
    fn kind(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let millis = match ctx.attribute(SLEEP_MS).map(str::parse::<u64>) {
            None => 0,
            Some(Ok(ms)) => ms,
            Some(Err(e)) => return TaskOutcome::error(format!("invalid {SLEEP_MS}: {e}")),
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                TaskOutcome::success().with_details(format!("slept {millis}ms"))
            }
            _ = ctx.stop.stopped() => {
                tracing::debug!("💤 Sleep task {} interrupted", ctx.task_id);
                TaskOutcome::success().with_details("interrupted")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsched_core::traits::runnable::{ResultCode, StopSignal};

    fn ctx(ms: &str, stop: StopSignal) -> TaskContext {
        let mut attributes = dsched_core::Attributes::new();
        attributes.insert(SLEEP_MS.into(), vec![ms.into()]);
        TaskContext {
            task_id: "t".into(),
            kind: "sleep".into(),
            attributes,
            stop,
        }
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let outcome = SleepTask.execute(ctx("5", StopSignal::new())).await;
        assert_eq!(outcome.code, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_sleep_stops_early() {
        let stop = StopSignal::new();
        stop.request_stop();
        let started = std::time::Instant::now();
        let outcome = SleepTask.execute(ctx("60000", stop)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.details.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn test_bad_duration() {
        let outcome = SleepTask.execute(ctx("soon", StopSignal::new())).await;
        assert_eq!(outcome.code, ResultCode::Error);
    }
}
