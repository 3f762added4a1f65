use std::sync::Arc;
use std::time::Duration;

use crate::cache::{task_meta_by_id, Cache};
use crate::error::Result;
use crate::scheduler::task::ActionKind;
use crate::store::{DoingFilter, SchedulerStore};

/// Why a schedule step switched its task to `pause`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// More unexpected results than the task tolerates.
    Tolerance { unexpected: u64, tolerance: i32 },
    /// A host listed in `TaskMeta::pause` was reached.
    PauseHost(String),
}

/// Result of one schedule step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// No waiting and no in-flight hosts left; the task was completed.
    Done,
    /// The task has no action row any more.
    Inactive,
    /// The action is not `start`; nothing was touched.
    Held(ActionKind),
    /// Meta could not be found.
    MissingMeta,
    /// Nothing to release this tick.
    Idle,
    /// The task was paused before releasing anything.
    Paused(PauseReason),
    /// `hosts` went from `waiting` to `running`, in dispatch order.
    Released {
        hosts: Vec<String>,
        paused_at: Option<String>,
    },
}

/// Per-task release logic: batch size, failure tolerance and pause gating.
pub struct Dispatcher {
    store: Arc<dyn SchedulerStore>,
    cache: Arc<dyn Cache>,
    meta_ttl: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn SchedulerStore>, cache: Arc<dyn Cache>, meta_ttl: Duration) -> Self {
        Self {
            store,
            cache,
            meta_ttl,
        }
    }

    /// Run one schedule step for task `id` at wall time `now`.
    pub async fn schedule(&self, id: i64, now: i64) -> Result<ScheduleOutcome> {
        let waiting = self.store.waiting_host_count(id).await?;
        if waiting == 0 && self.store.count_doing(&DoingFilter::task(id)).await? == 0 {
            self.store.complete_task(id).await?;
            tracing::info!(task_id = id, "Task done");
            return Ok(ScheduleOutcome::Done);
        }

        let Some(action) = self.store.task_action(id).await? else {
            return Ok(ScheduleOutcome::Inactive);
        };
        if action.action != ActionKind::Start {
            return Ok(ScheduleOutcome::Held(action.action));
        }

        let Some(meta) =
            task_meta_by_id(self.cache.as_ref(), self.store.as_ref(), id, self.meta_ttl).await?
        else {
            tracing::warn!(task_id = id, "Task meta not found");
            return Ok(ScheduleOutcome::MissingMeta);
        };

        let unexpected = self.store.unexpected_host_count(id).await?;
        if unexpected > u64::try_from(meta.tolerance).unwrap_or(0) {
            self.store
                .update_task_action(id, ActionKind::Pause, now)
                .await?;
            tracing::info!(
                task_id = id,
                unexpected,
                tolerance = meta.tolerance,
                "Tolerance exceeded, task paused"
            );
            return Ok(ScheduleOutcome::Paused(PauseReason::Tolerance {
                unexpected,
                tolerance: meta.tolerance,
            }));
        }

        if waiting == 0 {
            return Ok(ScheduleOutcome::Idle);
        }

        let need = if meta.batch == 0 {
            waiting
        } else {
            let doing = self.store.count_doing(&DoingFilter::task(id)).await?;
            let batch = u64::try_from(meta.batch).unwrap_or(0);
            match batch.checked_sub(doing) {
                Some(n) if n > 0 => n.min(waiting),
                _ => return Ok(ScheduleOutcome::Idle),
            }
        };

        let candidates = self.store.waiting_hosts(id, need).await?;
        if candidates.is_empty() {
            return Ok(ScheduleOutcome::Idle);
        }

        let pause_hosts = meta.pause_hosts();
        let pause_at = candidates
            .iter()
            .position(|h| pause_hosts.contains(h.host.as_str()));
        let end = pause_at.map_or(candidates.len(), |i| i + 1);

        let window: Vec<String> = candidates[..end].iter().map(|h| h.host.clone()).collect();
        let hosts = self.store.run_waiting_hosts(id, &window, now).await?;

        let paused_at = match pause_at {
            Some(i) => {
                let host = candidates[i].host.clone();
                self.store
                    .update_task_action(id, ActionKind::Pause, now)
                    .await?;
                tracing::info!(task_id = id, host = %host, "Reached pause host, task paused");
                Some(host)
            }
            None => None,
        };

        if !hosts.is_empty() {
            tracing::debug!(task_id = id, released = hosts.len(), "Released hosts");
        }

        Ok(ScheduleOutcome::Released { hosts, paused_at })
    }
}
