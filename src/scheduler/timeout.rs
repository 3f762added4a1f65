use std::sync::Arc;
use std::time::Duration;

use crate::cache::{task_meta_by_id, Cache};
use crate::error::Result;
use crate::scheduler::task::TIMEOUT_SLACK_SECS;
use crate::store::{DoingFilter, SchedulerStore};

/// Marks in-flight hosts `timeout` once `clock + timeout + 3s` has passed.
pub struct TimeoutEnforcer {
    store: Arc<dyn SchedulerStore>,
    cache: Arc<dyn Cache>,
    meta_ttl: Duration,
}

impl TimeoutEnforcer {
    pub fn new(store: Arc<dyn SchedulerStore>, cache: Arc<dyn Cache>, meta_ttl: Duration) -> Self {
        Self {
            store,
            cache,
            meta_ttl,
        }
    }

    /// Check every assignment of task `id`. Returns the hosts marked `timeout`.
    pub async fn check(&self, id: i64, now: i64) -> Result<Vec<String>> {
        let doing = self.store.doing_records(&DoingFilter::task(id)).await?;
        if doing.is_empty() {
            return Ok(Vec::new());
        }

        let Some(meta) =
            task_meta_by_id(self.cache.as_ref(), self.store.as_ref(), id, self.meta_ttl).await?
        else {
            return Ok(Vec::new());
        };
        let deadline = i64::from(meta.timeout) + TIMEOUT_SLACK_SECS;

        let mut timed_out = Vec::new();
        for entry in doing.into_iter().filter(|d| now - d.clock > deadline) {
            // A row changed or removed since the read is left alone.
            if self.store.mark_timeout(id, &entry.host, entry.clock).await? {
                tracing::info!(
                    task_id = id,
                    host = %entry.host,
                    clock = entry.clock,
                    "Host timed out"
                );
                timed_out.push(entry.host);
            }
        }

        Ok(timed_out)
    }
}
