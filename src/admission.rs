//! Engine operations behind the task admission surface.
//!
//! The HTTP CRUD layer lives elsewhere; it calls into [`Admission`] to create
//! tasks, change their action and act on single hosts.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::error::{DispatchError, Result};
use crate::scheduler::task::{
    ActionKind, DoingAction, HostStatus, TaskHost, TaskHostDoing, TaskMeta,
};
use crate::store::{SchedulerStore, TaskStore};

/// Task creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskForm {
    pub title: String,
    pub account: String,
    #[serde(default)]
    pub batch: i32,
    #[serde(default)]
    pub tolerance: i32,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub pause: String,
    pub script: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub creator: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub alert_triggered: bool,
}

impl TaskForm {
    fn to_meta(&self) -> TaskMeta {
        TaskMeta {
            batch: self.batch,
            tolerance: self.tolerance,
            timeout: self.timeout,
            pause: self.pause.clone(),
            args: self.args.clone(),
            stdin: self.stdin.clone(),
            creator: self.creator.clone(),
            ..TaskMeta::new(&self.title, &self.account, &self.script)
        }
    }
}

/// Trim hosts and drop blank and `#`-commented entries.
pub fn clean_hosts(hosts: &[String]) -> Vec<String> {
    hosts
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty() && !h.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Operator action on one host of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    Kill,
    Ignore,
    Redo,
}

impl FromStr for HostAction {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kill" => Ok(HostAction::Kill),
            "ignore" => Ok(HostAction::Ignore),
            "redo" => Ok(HostAction::Redo),
            other => Err(DispatchError::validation(format!("action({other}) invalid"))),
        }
    }
}

pub struct Admission {
    tasks: Arc<dyn TaskStore>,
    /// Present on the center only.
    scheduler_store: Option<Arc<dyn SchedulerStore>>,
    cache: Arc<dyn Cache>,
    meta_ttl: Duration,
}

impl Admission {
    pub fn center(
        store: Arc<dyn SchedulerStore>,
        tasks: Arc<dyn TaskStore>,
        cache: Arc<dyn Cache>,
        meta_ttl: Duration,
    ) -> Self {
        Self {
            tasks,
            scheduler_store: Some(store),
            cache,
            meta_ttl,
        }
    }

    pub fn edge(tasks: Arc<dyn TaskStore>, cache: Arc<dyn Cache>, meta_ttl: Duration) -> Self {
        Self {
            tasks,
            scheduler_store: None,
            cache,
            meta_ttl,
        }
    }

    fn center_store(&self) -> Result<&Arc<dyn SchedulerStore>> {
        self.scheduler_store
            .as_ref()
            .ok_or_else(|| DispatchError::validation("operation is only available on the center"))
    }

    /// Validate and create a task. Returns its id.
    ///
    /// On the center the task is saved with all hosts `waiting`. On an edge
    /// only alert-triggered tasks are accepted: they run on the first host
    /// straight from the cache, with an id minted locally if the center
    /// cannot be reached.
    pub async fn add_task(&self, form: &TaskForm, now: i64) -> Result<i64> {
        let hosts = clean_hosts(&form.hosts);
        let Some(first) = hosts.first() else {
            return Err(DispatchError::validation("arg(hosts) empty"));
        };

        let mut meta = form.to_meta();
        meta.clean_fields()?;
        meta.handle_fh(first);

        let id = match &self.scheduler_store {
            Some(store) => {
                let action = match form.action.as_str() {
                    "" | "start" => ActionKind::Start,
                    "pause" => ActionKind::Pause,
                    other => {
                        return Err(DispatchError::validation(format!(
                            "arg(action) {other} invalid, should be start or pause"
                        )))
                    }
                };
                store.save_task(&meta, &hosts, action, now).await?
            }
            None if form.alert_triggered => self.add_cached_task(meta, first, now).await?,
            None => {
                return Err(DispatchError::validation(
                    "only alert triggered tasks can be added on an edge",
                ))
            }
        };

        tracing::info!(task_id = id, title = %form.title, creator = %form.creator, hosts = hosts.len(), "Task added");
        Ok(id)
    }

    async fn add_cached_task(&self, mut meta: TaskMeta, host: &str, now: i64) -> Result<i64> {
        match self.tasks.create_task_meta(&meta).await {
            Ok(id) => {
                meta.id = id;
                let row = TaskHost::new(id, host, HostStatus::Running);
                if let Err(e) = self.tasks.upsert_task_host(&row).await {
                    tracing::warn!(task_id = id, host = %host, error = %e, "Failed to record host of cached task");
                }
            }
            Err(e) => {
                meta.id = self.cache.next_id().await?;
                tracing::warn!(task_id = meta.id, error = %e, "Center unreachable, minted local task id");
            }
        }

        let doing = TaskHostDoing::new(meta.id, host, now, DoingAction::Start);
        self.cache.cache_task(&meta, &doing, self.meta_ttl).await?;
        Ok(meta.id)
    }

    /// Change the action of an active task.
    pub async fn update_action(&self, id: i64, action: &str, now: i64) -> Result<()> {
        let action: ActionKind = action.parse()?;
        self.center_store()?
            .update_task_action(id, action, now)
            .await?;
        tracing::info!(task_id = id, action = %action, "Task action updated");
        Ok(())
    }

    /// Kill, ignore or redo a single host.
    pub async fn host_action(&self, id: i64, host: &str, action: HostAction, now: i64) -> Result<()> {
        let store = self.center_store()?;
        let Some(row) = store.task_host(id, host).await? else {
            return Err(DispatchError::HostNotFound {
                id,
                host: host.to_string(),
            });
        };

        if store.task_action(id).await?.is_none() {
            return Err(DispatchError::InvalidState(format!("task {id} is already done")));
        }

        match action {
            HostAction::Ignore => store.ignore_host(id, host).await?,
            HostAction::Kill | HostAction::Redo => {
                if action == HostAction::Kill
                    && !matches!(row.status, HostStatus::Running | HostStatus::Timeout)
                {
                    return Err(DispatchError::InvalidState(format!(
                        "host status is {}, cannot kill",
                        row.status
                    )));
                }
                let doing_action = match action {
                    HostAction::Kill => DoingAction::Kill,
                    _ => DoingAction::Start,
                };
                store.redo_host(id, host, doing_action, now).await?;
            }
        }

        tracing::info!(task_id = id, host = %host, action = ?action, "Host action applied");
        Ok(())
    }

    /// Subset of `ids` that are done (no action row left).
    pub async fn done_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let active = self.center_store()?.active_task_ids(ids).await?;
        Ok(ids.iter().copied().filter(|id| !active.contains(id)).collect())
    }
}
