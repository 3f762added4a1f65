//! Agent report reconciliation.
//!
//! Agents call [`Reconciler::report`] periodically with the results of what
//! they ran and get back the full set of what they should be running now.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::{task_meta_by_id, Cache, ID_INITIAL};
use crate::doing::DoingCache;
use crate::error::{DispatchError, Result};
use crate::scheduler::task::{DoingAction, HostStatus, MarkDone, TaskHost, TaskHostDoing};
use crate::store::TaskStore;

/// One task result carried by an agent report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedTask {
    pub id: i64,
    pub clock: i64,
    pub status: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub ident: String,
    #[serde(default)]
    pub report_tasks: Vec<ReportedTask>,
}

/// One assignment handed back to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignTask {
    pub id: i64,
    pub clock: i64,
    pub action: DoingAction,
}

impl From<TaskHostDoing> for AssignTask {
    fn from(doing: TaskHostDoing) -> Self {
        Self {
            id: doing.id,
            clock: doing.clock,
            action: doing.action,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub assign_tasks: Vec<AssignTask>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetaResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub stdin: String,
}

/// Terminal results of cache-only tasks waiting to be written to the store.
#[derive(Debug, Clone, Default)]
pub struct ResultBuffer {
    inner: Arc<Mutex<Vec<TaskHost>>>,
}

impl ResultBuffer {
    pub async fn push(&self, host: TaskHost) {
        self.inner.lock().await.push(host);
    }

    async fn drain(&self) -> Vec<TaskHost> {
        std::mem::take(&mut *self.inner.lock().await)
    }

    async fn requeue(&self, mut hosts: Vec<TaskHost>) {
        let mut inner = self.inner.lock().await;
        hosts.append(&mut inner);
        *inner = hosts;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Outcome of one flush of the [`ResultBuffer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    /// Results of locally minted ids; logged, never persisted.
    pub skipped: usize,
    pub requeued: usize,
}

pub struct Reconciler {
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn Cache>,
    doing: DoingCache,
    results: ResultBuffer,
    continuous_output: bool,
    meta_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        cache: Arc<dyn Cache>,
        doing: DoingCache,
        continuous_output: bool,
        meta_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            doing,
            results: ResultBuffer::default(),
            continuous_output,
            meta_ttl,
        }
    }

    pub fn results(&self) -> &ResultBuffer {
        &self.results
    }

    pub fn doing(&self) -> &DoingCache {
        &self.doing
    }

    /// Fold the reported results in, then return the agent's current assignments.
    ///
    /// Per-task failures are logged; the agent retries on its next report.
    pub async fn report(&self, req: ReportRequest) -> ReportResponse {
        if req.ident.trim().is_empty() {
            return ReportResponse {
                message: "ident is blank".to_string(),
                assign_tasks: Vec::new(),
            };
        }

        for task in &req.report_tasks {
            if let Err(e) = self.apply(&req.ident, task).await {
                tracing::warn!(
                    task_id = task.id,
                    host = %req.ident,
                    status = %task.status,
                    error = %e,
                    "Failed to apply task report"
                );
            }
        }

        ReportResponse {
            message: String::new(),
            assign_tasks: self
                .doing
                .get(&req.ident)
                .await
                .into_iter()
                .map(AssignTask::from)
                .collect(),
        }
    }

    async fn apply(&self, ident: &str, task: &ReportedTask) -> Result<()> {
        let status: HostStatus = match task.status.parse() {
            Ok(status) => status,
            Err(_) => {
                tracing::debug!(task_id = task.id, status = %task.status, "Ignoring unknown report status");
                return Ok(());
            }
        };

        if self.continuous_output && status == HostStatus::Running {
            return self
                .store
                .update_output(task.id, ident, &task.stdout, &task.stderr)
                .await;
        }

        if !status.is_reportable_result() {
            return Ok(());
        }

        let Some(entry) = self.doing.find(ident, task.id).await else {
            tracing::debug!(task_id = task.id, host = %ident, "Dropping report of finished task");
            return Ok(());
        };

        self.mark_done(
            &entry,
            MarkDone {
                id: task.id,
                clock: task.clock,
                host: ident.to_string(),
                status,
                stdout: task.stdout.clone(),
                stderr: task.stderr.clone(),
            },
        )
        .await
    }

    /// Record a terminal result for an assignment.
    ///
    /// Cache-only (alert-triggered) assignments are removed from the cache and
    /// their result buffered for the store; store-backed ones go through
    /// [`TaskStore::mark_done`].
    pub async fn mark_done(&self, entry: &TaskHostDoing, done: MarkDone) -> Result<()> {
        if !entry.alert_triggered {
            self.store.mark_done(&done).await?;
            tracing::debug!(task_id = done.id, host = %done.host, status = %done.status, "Host done");
            return Ok(());
        }

        let removed = self.cache.remove_host_doing(&done.host, done.id).await?;
        self.cache.delete_meta(done.id).await?;
        if removed {
            self.results
                .push(TaskHost {
                    id: done.id,
                    host: done.host.clone(),
                    status: done.status,
                    stdout: done.stdout,
                    stderr: done.stderr,
                })
                .await;
            tracing::debug!(task_id = done.id, host = %done.host, "Cached host done");
        }
        Ok(())
    }

    pub async fn get_task_meta(&self, id: i64) -> TaskMetaResponse {
        match task_meta_by_id(self.cache.as_ref(), self.store.as_ref(), id, self.meta_ttl).await {
            Ok(Some(meta)) => TaskMetaResponse {
                message: String::new(),
                script: meta.script,
                args: meta.args,
                account: meta.account,
                stdin: meta.stdin,
            },
            Ok(None) => TaskMetaResponse {
                message: format!("task meta not found: {id}"),
                ..TaskMetaResponse::default()
            },
            Err(e) => TaskMetaResponse {
                message: e.to_string(),
                ..TaskMetaResponse::default()
            },
        }
    }

    /// Write buffered cache-task results to the store.
    ///
    /// Locally minted ids are logged only. On a retryable failure the batch is
    /// put back for the next flush.
    pub async fn flush_cached_results(&self) -> FlushReport {
        let drained = self.results.drain().await;
        if drained.is_empty() {
            return FlushReport::default();
        }

        let (local, persistable): (Vec<_>, Vec<_>) =
            drained.into_iter().partition(|h| h.id >= ID_INITIAL);

        for host in &local {
            tracing::info!(
                task_id = host.id,
                host = %host.host,
                status = %host.status,
                stdout = %host.stdout,
                stderr = %host.stderr,
                "Result of locally minted task"
            );
        }

        let mut report = FlushReport {
            skipped: local.len(),
            ..FlushReport::default()
        };
        if persistable.is_empty() {
            return report;
        }

        match self.store.upsert_task_hosts(&persistable).await {
            Ok(errors) => {
                for (key, error) in &errors {
                    tracing::warn!(key = %key, error = %error, "Failed to persist cached result");
                }
                report.persisted = persistable.len() - errors.len();
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, count = persistable.len(), "Cached results not persisted, will retry");
                report.requeued = persistable.len();
                self.results.requeue(persistable).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, count = persistable.len(), "Dropping cached results");
            }
        }

        report
    }

    pub async fn run_result_flusher(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let report = self.flush_cached_results().await;
                    tracing::info!(persisted = report.persisted, "Result flusher shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.flush_cached_results().await;
                    if report != FlushReport::default() {
                        tracing::debug!(?report, "Flushed cached results");
                    }
                }
            }
        }
    }
}
