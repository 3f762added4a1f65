pub mod cleaner;
pub mod dispatch;
pub mod ownership;
pub mod task;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use cleaner::LongTaskCleaner;
pub use dispatch::{Dispatcher, PauseReason, ScheduleOutcome};
pub use ownership::OwnershipManager;
pub use task::{
    unix_now, ActionKind, DoingAction, HostStatus, MarkDone, TaskAction, TaskHost, TaskHostDoing,
    TaskMeta,
};
pub use timeout::TimeoutEnforcer;

/// Drives every task owned by this replica: timeout check, then schedule step.
pub struct Scheduler {
    ownership: Arc<OwnershipManager>,
    timeouts: TimeoutEnforcer,
    dispatcher: Dispatcher,
}

impl Scheduler {
    pub fn new(
        ownership: Arc<OwnershipManager>,
        timeouts: TimeoutEnforcer,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            ownership,
            timeouts,
            dispatcher,
        }
    }

    /// One pass over the owned tasks, sequentially.
    ///
    /// A failing task is logged and skipped; the next tick retries it.
    pub async fn tick(&self, now: i64) -> crate::error::Result<Vec<(i64, ScheduleOutcome)>> {
        let ids = self.ownership.owned_task_ids().await?;
        let mut outcomes = Vec::with_capacity(ids.len());

        for id in ids {
            if let Err(e) = self.timeouts.check(id, now).await {
                tracing::warn!(task_id = id, error = %e, "Timeout check failed");
                continue;
            }
            match self.dispatcher.schedule(id, now).await {
                Ok(outcome) => outcomes.push((id, outcome)),
                Err(e) => tracing::warn!(task_id = id, error = %e, "Schedule step failed"),
            }
        }

        Ok(outcomes)
    }

    pub async fn run(self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            scheduler = %self.ownership.identity(),
            period_ms = period.as_millis() as u64,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(unix_now()).await {
                        tracing::warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }
}
