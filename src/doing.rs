//! In-memory projection of what every host is currently doing.
//!
//! [`DoingCache`] maps `host -> [TaskHostDoing]` and is the only source the
//! agent RPC consults. [`DoingProjector`] rebuilds it from the union of the
//! `task_host_doing` table and the cache hash, then swaps it in whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::scheduler::task::TaskHostDoing;
use crate::store::{DoingFilter, TaskStore};

type DoingMap = HashMap<String, Vec<TaskHostDoing>>;

/// Read-mostly `host -> assignments` map shared by the RPC handlers.
#[derive(Debug, Clone, Default)]
pub struct DoingCache {
    inner: Arc<RwLock<DoingMap>>,
}

impl DoingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current assignments of `host`.
    pub async fn get(&self, host: &str) -> Vec<TaskHostDoing> {
        self.inner
            .read()
            .await
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn find(&self, host: &str, id: i64) -> Option<TaskHostDoing> {
        self.inner
            .read()
            .await
            .get(host)?
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Swap in a freshly built snapshot.
    pub async fn replace(&self, entries: impl IntoIterator<Item = TaskHostDoing>) {
        let mut map = DoingMap::new();
        for entry in entries {
            map.entry(entry.host.clone()).or_default().push(entry);
        }
        *self.inner.write().await = map;
    }

    /// Number of hosts with at least one assignment.
    pub async fn host_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Rebuilds a [`DoingCache`] on a fixed cadence.
///
/// If one source fails, its last good snapshot is reused so a store outage
/// does not hide cache-only assignments and vice versa.
pub struct DoingProjector {
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn Cache>,
    doing: DoingCache,
    last_store: Vec<TaskHostDoing>,
    last_cache: Vec<TaskHostDoing>,
}

impl DoingProjector {
    pub fn new(store: Arc<dyn TaskStore>, cache: Arc<dyn Cache>, doing: DoingCache) -> Self {
        Self {
            store,
            cache,
            doing,
            last_store: Vec::new(),
            last_cache: Vec::new(),
        }
    }

    /// Rebuild once. Returns false when both sources failed and the map was kept.
    pub async fn refresh(&mut self) -> bool {
        let store_ok = match self.store.doing_records(&DoingFilter::all()).await {
            Ok(rows) => {
                self.last_store = rows;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load task_host_doing, keeping previous snapshot");
                false
            }
        };

        let cache_ok = match self.cache.host_doing_all().await {
            Ok(mut rows) => {
                for row in &mut rows {
                    row.alert_triggered = true;
                }
                self.last_cache = rows;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load cached host doing, keeping previous snapshot");
                false
            }
        };

        if !store_ok && !cache_ok {
            return false;
        }

        self.doing
            .replace(
                self.last_store
                    .iter()
                    .chain(self.last_cache.iter())
                    .cloned(),
            )
            .await;
        true
    }

    pub async fn run(mut self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period_ms = period.as_millis() as u64, "Doing projector started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Doing projector shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.refresh().await;
                }
            }
        }
    }
}
