//! Relational store for task state.
//!
//! Two capability traits split the store the same way deployments do:
//! - [`TaskStore`]: the subset an edge replica forwards to the center
//!   (meta creation, host upserts, doing/meta read-through, `MarkDone`).
//! - [`SchedulerStore`]: everything the center-side scheduling loops need
//!   (heartbeats, ownership CAS, batch release, timeouts, completion).
//!
//! Implementations:
//! - [`PostgresStore`]: production store on `sqlx`/PostgreSQL.
//! - [`MemoryStore`]: same semantics in process, for tests and single-node runs.
//! - [`crate::center::CenterClient`]: edge-side [`TaskStore`] tunnelled to the center.

mod memory;
mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::task::{ActionKind, MarkDone, TaskAction, TaskHost, TaskHostDoing, TaskMeta};

pub use memory::MemoryStore;
pub use postgres::{run_migrations, PostgresStore};

/// Filter over `task_host_doing` rows. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoingFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<i64>,
}

impl DoingFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn task(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn matches(&self, doing: &TaskHostDoing) -> bool {
        self.id.map_or(true, |id| doing.id == id)
            && self.host.as_deref().map_or(true, |h| doing.host == h)
            && self.clock.map_or(true, |c| doing.clock == c)
    }
}

/// Typed record query used by edge replicas to read through the center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table")]
pub enum RecordQuery {
    #[serde(rename = "task_host_doing")]
    HostDoing(DoingFilter),
    #[serde(rename = "task_meta")]
    TaskMeta { id: i64 },
}

/// Per-row failures of a bulk host upsert, keyed by `"<id>:<host>"`.
pub type UpsertErrors = HashMap<String, String>;

/// Store operations available on every replica (forwarded to the center on edges).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task meta row and return its id.
    async fn create_task_meta(&self, meta: &TaskMeta) -> Result<i64>;

    async fn task_meta(&self, id: i64) -> Result<Option<TaskMeta>>;

    /// Insert or overwrite `(status, stdout, stderr)` of one host row.
    async fn upsert_task_host(&self, host: &TaskHost) -> Result<()>;

    async fn upsert_task_hosts(&self, hosts: &[TaskHost]) -> Result<UpsertErrors>;

    async fn doing_records(&self, filter: &DoingFilter) -> Result<Vec<TaskHostDoing>>;

    async fn count_doing(&self, filter: &DoingFilter) -> Result<u64>;

    /// Fold a terminal agent result into the store.
    ///
    /// Only applies when the `(id, host, clock)` doing row still exists, so a
    /// stale report can never overwrite a fresher assignment. A late result for
    /// a host already marked `timeout` only records its output.
    async fn mark_done(&self, done: &MarkDone) -> Result<()>;

    /// Streaming output of a running host; does not change its status.
    async fn update_output(&self, id: i64, host: &str, stdout: &str, stderr: &str) -> Result<()>;
}

/// Store operations used by the center-side scheduling loops.
#[async_trait]
pub trait SchedulerStore: TaskStore {
    // -- replica liveness (C1) --

    async fn heartbeat(&self, scheduler: &str, clock: i64) -> Result<()>;

    /// Replicas whose last heartbeat is older than `before_clock`.
    async fn dead_schedulers(&self, before_clock: i64) -> Result<Vec<String>>;

    async fn delete_scheduler_health(&self, scheduler: &str) -> Result<()>;

    // -- ownership (C2) --

    async fn tasks_of_scheduler(&self, scheduler: &str) -> Result<Vec<i64>>;

    async fn orphan_task_ids(&self) -> Result<Vec<i64>>;

    /// Compare-and-set `task_scheduler.scheduler` from `expected` to `owner`.
    async fn take_over_task(&self, id: i64, expected: &str, owner: &str) -> Result<bool>;

    // -- task lifecycle --

    /// Create meta, ownership (unowned), action and `waiting` hosts atomically.
    async fn save_task(
        &self,
        meta: &TaskMeta,
        hosts: &[String],
        action: ActionKind,
        clock: i64,
    ) -> Result<i64>;

    async fn task_action(&self, id: i64) -> Result<Option<TaskAction>>;

    /// Ids among `ids` that still have a `task_action` row.
    async fn active_task_ids(&self, ids: &[i64]) -> Result<Vec<i64>>;

    /// Set the action and apply its side effects in one transaction:
    /// `start` releases ownership, `cancel` cancels waiting hosts, `kill`
    /// additionally turns every in-flight assignment into a kill.
    async fn update_task_action(&self, id: i64, action: ActionKind, clock: i64) -> Result<()>;

    /// Delete `task_action`, `task_scheduler` and leftover doing rows.
    async fn complete_task(&self, id: i64) -> Result<()>;

    /// Active tasks created before `before`, excluding ones already cancelled or killed.
    async fn long_task_ids(
        &self,
        before: chrono::DateTime<chrono::Utc>,
        limit: i64,
    ) -> Result<Vec<i64>>;

    // -- hosts (C3/C4) --

    async fn task_hosts(&self, id: i64) -> Result<Vec<TaskHost>>;

    async fn task_host(&self, id: i64, host: &str) -> Result<Option<TaskHost>>;

    async fn waiting_host_count(&self, id: i64) -> Result<u64>;

    /// Waiting hosts in dispatch (`ii`) order.
    async fn waiting_hosts(&self, id: i64, limit: u64) -> Result<Vec<TaskHost>>;

    /// Hosts that ended `failed`, `timeout` or `killed`.
    async fn unexpected_host_count(&self, id: i64) -> Result<u64>;

    /// Flip `waiting -> running` and upsert the doing row for each host.
    ///
    /// Hosts no longer waiting are skipped; nothing is released once the
    /// task's action row is gone. Returns the hosts actually released.
    async fn run_waiting_hosts(&self, id: i64, hosts: &[String], clock: i64) -> Result<Vec<String>>;

    /// Mark the `(id, host, clock)` assignment as `timeout`. Returns false if the
    /// assignment changed or disappeared in the meantime.
    async fn mark_timeout(&self, id: i64, host: &str, clock: i64) -> Result<bool>;

    // -- host actions --

    /// Upsert the doing row with `action` and set the host status, atomically.
    async fn redo_host(
        &self,
        id: i64,
        host: &str,
        action: crate::scheduler::task::DoingAction,
        clock: i64,
    ) -> Result<()>;

    /// Set a host `ignored` and drop its assignment.
    async fn ignore_host(&self, id: i64, host: &str) -> Result<()>;
}
