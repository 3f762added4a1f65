//! Long-task cleaner.
//!
//! Cancels active tasks created longer ago than the retention bound. Cancelled
//! tasks then drain through the normal completion path of the scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::scheduler::task::ActionKind;
use crate::store::SchedulerStore;

pub struct LongTaskCleaner {
    store: Arc<dyn SchedulerStore>,
    retention: Duration,
    limit: i64,
}

impl LongTaskCleaner {
    pub fn new(store: Arc<dyn SchedulerStore>, retention: Duration, limit: i64) -> Self {
        Self {
            store,
            retention,
            limit,
        }
    }

    /// Cancel up to `limit` expired tasks. Returns the cancelled ids.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| DispatchError::Internal(format!("invalid retention: {e}")))?;
        let ids = self.store.long_task_ids(now - retention, self.limit).await?;

        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            match self
                .store
                .update_task_action(id, ActionKind::Cancel, now.timestamp())
                .await
            {
                Ok(()) => cancelled.push(id),
                Err(DispatchError::TaskNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), ids = ?cancelled, "Cancelled long-running tasks");
        }
        Ok(cancelled)
    }

    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            limit = self.limit,
            "Long-task cleaner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Long-task cleaner shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::warn!(error = %e, "Long-task sweep failed");
                    }
                }
            }
        }
    }
}
