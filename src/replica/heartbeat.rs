use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::error::Result;
use crate::scheduler::task::unix_now;
use crate::scheduler::OwnershipManager;
use crate::store::SchedulerStore;

/// What one heartbeat tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Orphans claimed by this replica.
    pub claimed: Vec<i64>,
    /// Tasks taken over from dead peers.
    pub taken_over: Vec<i64>,
    /// Dead peers owning nothing, whose health row was deleted.
    pub reclaimed: Vec<String>,
}

/// Liveness of this replica plus detection of dead peers.
pub struct Heartbeat {
    store: Arc<dyn SchedulerStore>,
    ownership: Arc<OwnershipManager>,
    config: HeartbeatConfig,
}

impl Heartbeat {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        ownership: Arc<OwnershipManager>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            ownership,
            config,
        }
    }

    /// Renew liveness, claim orphans, then deal with dead peers.
    ///
    /// A failed heartbeat write aborts the tick before anything else runs.
    pub async fn tick(&self, now: i64) -> Result<HeartbeatReport> {
        let me = self.ownership.identity().as_str();
        self.store.heartbeat(me, now).await?;

        let mut report = HeartbeatReport {
            claimed: self.ownership.claim_orphans().await?,
            ..HeartbeatReport::default()
        };

        let before = now - self.config.dead_after_secs();
        for dead in self.store.dead_schedulers(before).await? {
            if dead == me {
                continue;
            }

            let ids = self.store.tasks_of_scheduler(&dead).await?;
            if ids.is_empty() {
                self.store.delete_scheduler_health(&dead).await?;
                tracing::info!(scheduler = %dead, "Removed health of dead scheduler");
                report.reclaimed.push(dead);
                continue;
            }

            tracing::warn!(scheduler = %dead, tasks = ids.len(), "Scheduler is dead, taking over its tasks");
            let taken = self.ownership.take_over_dead(&dead, &ids).await?;
            report.taken_over.extend(taken);
        }

        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            scheduler = %self.ownership.identity(),
            interval_ms = self.config.interval_ms,
            dead_after_secs = self.config.dead_after_secs(),
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Heartbeat shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(unix_now()).await {
                        tracing::warn!(error = %e, "Heartbeat tick failed");
                    }
                }
            }
        }
    }
}
