//! In-memory store with the same semantics as the PostgreSQL store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DoingFilter, SchedulerStore, TaskStore, UpsertErrors};
use crate::error::{DispatchError, Result};
use crate::scheduler::task::{
    ActionKind, DoingAction, HostStatus, MarkDone, TaskAction, TaskHost, TaskHostDoing, TaskMeta,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_meta_id: i64,
    next_ii: i64,
    metas: BTreeMap<i64, TaskMeta>,
    actions: BTreeMap<i64, TaskAction>,
    schedulers: BTreeMap<i64, String>,
    health: HashMap<String, i64>,
    /// Host rows per task, kept in `ii` order.
    hosts: HashMap<i64, Vec<(i64, TaskHost)>>,
    doing: Vec<TaskHostDoing>,
}

impl MemoryState {
    fn host_mut(&mut self, id: i64, host: &str) -> Option<&mut TaskHost> {
        self.hosts
            .get_mut(&id)?
            .iter_mut()
            .map(|(_, row)| row)
            .find(|row| row.host == host)
    }

    fn insert_host(&mut self, row: TaskHost) {
        self.next_ii += 1;
        let ii = self.next_ii;
        self.hosts.entry(row.id).or_default().push((ii, row));
    }

    fn upsert_host(&mut self, row: &TaskHost) {
        match self.host_mut(row.id, &row.host) {
            Some(existing) => {
                existing.status = row.status;
                existing.stdout = row.stdout.clone();
                existing.stderr = row.stderr.clone();
            }
            None => self.insert_host(row.clone()),
        }
    }

    fn upsert_doing(&mut self, id: i64, host: &str, clock: i64, action: DoingAction) {
        match self.doing.iter_mut().find(|d| d.id == id && d.host == host) {
            Some(existing) => {
                existing.clock = clock;
                existing.action = action;
            }
            None => self
                .doing
                .push(TaskHostDoing::new(id, host, clock, action)),
        }
    }

    fn host_rows(&self, id: i64) -> impl Iterator<Item = &TaskHost> {
        self.hosts
            .get(&id)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(_, row)| row))
    }

    fn set_status_where(&mut self, id: i64, from: HostStatus, to: HostStatus) {
        if let Some(rows) = self.hosts.get_mut(&id) {
            for (_, row) in rows.iter_mut().filter(|(_, r)| r.status == from) {
                row.status = to;
            }
        }
    }
}

/// Store that keeps every table in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of a task, if it has an ownership row.
    pub async fn owner_of(&self, id: i64) -> Option<String> {
        self.state.lock().await.schedulers.get(&id).cloned()
    }

    /// Last heartbeat clock of a replica.
    pub async fn health_clock(&self, scheduler: &str) -> Option<i64> {
        self.state.lock().await.health.get(scheduler).copied()
    }

    /// Insert a raw ownership row, bypassing admission.
    pub async fn set_owner(&self, id: i64, scheduler: &str) {
        self.state
            .lock()
            .await
            .schedulers
            .insert(id, scheduler.to_string());
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task_meta(&self, meta: &TaskMeta) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_meta_id += 1;
        let id = state.next_meta_id;
        let mut row = meta.clone();
        row.id = id;
        state.metas.insert(id, row);
        Ok(id)
    }

    async fn task_meta(&self, id: i64) -> Result<Option<TaskMeta>> {
        Ok(self.state.lock().await.metas.get(&id).cloned())
    }

    async fn upsert_task_host(&self, host: &TaskHost) -> Result<()> {
        self.state.lock().await.upsert_host(host);
        Ok(())
    }

    async fn upsert_task_hosts(&self, hosts: &[TaskHost]) -> Result<UpsertErrors> {
        if hosts.is_empty() {
            return Err(DispatchError::validation("empty list"));
        }
        let mut state = self.state.lock().await;
        for host in hosts {
            state.upsert_host(host);
        }
        Ok(UpsertErrors::new())
    }

    async fn doing_records(&self, filter: &DoingFilter) -> Result<Vec<TaskHostDoing>> {
        let state = self.state.lock().await;
        Ok(state
            .doing
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn count_doing(&self, filter: &DoingFilter) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.doing.iter().filter(|d| filter.matches(d)).count() as u64)
    }

    async fn mark_done(&self, done: &MarkDone) -> Result<()> {
        let mut state = self.state.lock().await;
        let position = state
            .doing
            .iter()
            .position(|d| d.id == done.id && d.host == done.host && d.clock == done.clock);

        match position {
            Some(pos) => {
                if let Some(row) = state.host_mut(done.id, &done.host) {
                    row.status = done.status;
                    row.stdout = done.stdout.clone();
                    row.stderr = done.stderr.clone();
                }
                state.doing.remove(pos);
            }
            None => {
                if let Some(row) = state.host_mut(done.id, &done.host) {
                    if row.status == HostStatus::Timeout {
                        row.stdout = done.stdout.clone();
                        row.stderr = done.stderr.clone();
                    }
                }
            }
        }
        Ok(())
    }

    async fn update_output(&self, id: i64, host: &str, stdout: &str, stderr: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.host_mut(id, host) {
            row.stdout = stdout.to_string();
            row.stderr = stderr.to_string();
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn heartbeat(&self, scheduler: &str, clock: i64) -> Result<()> {
        self.state
            .lock()
            .await
            .health
            .insert(scheduler.to_string(), clock);
        Ok(())
    }

    async fn dead_schedulers(&self, before_clock: i64) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut dead: Vec<String> = state
            .health
            .iter()
            .filter(|(_, clock)| **clock < before_clock)
            .map(|(scheduler, _)| scheduler.clone())
            .collect();
        dead.sort();
        Ok(dead)
    }

    async fn delete_scheduler_health(&self, scheduler: &str) -> Result<()> {
        self.state.lock().await.health.remove(scheduler);
        Ok(())
    }

    async fn tasks_of_scheduler(&self, scheduler: &str) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .schedulers
            .iter()
            .filter(|(_, owner)| owner.as_str() == scheduler)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn orphan_task_ids(&self) -> Result<Vec<i64>> {
        self.tasks_of_scheduler("").await
    }

    async fn take_over_task(&self, id: i64, expected: &str, owner: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.schedulers.get_mut(&id) {
            Some(current) if current == expected => {
                *current = owner.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_task(
        &self,
        meta: &TaskMeta,
        hosts: &[String],
        action: ActionKind,
        clock: i64,
    ) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_meta_id += 1;
        let id = state.next_meta_id;

        let mut row = meta.clone();
        row.id = id;
        state.metas.insert(id, row);
        state.schedulers.insert(id, String::new());
        state.actions.insert(id, TaskAction { id, action, clock });

        for host in hosts.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
            state.insert_host(TaskHost::new(id, host, HostStatus::Waiting));
        }

        Ok(id)
    }

    async fn task_action(&self, id: i64) -> Result<Option<TaskAction>> {
        Ok(self.state.lock().await.actions.get(&id).cloned())
    }

    async fn active_task_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.actions.contains_key(id))
            .collect())
    }

    async fn update_task_action(&self, id: i64, action: ActionKind, clock: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.actions.get_mut(&id) {
            Some(row) => {
                row.action = action;
                row.clock = clock;
            }
            None => return Err(DispatchError::TaskNotFound(id)),
        }

        match action {
            ActionKind::Start => {
                if let Some(owner) = state.schedulers.get_mut(&id) {
                    owner.clear();
                }
            }
            ActionKind::Pause => {}
            ActionKind::Cancel => {
                state.set_status_where(id, HostStatus::Waiting, HostStatus::Cancelled);
            }
            ActionKind::Kill => {
                state.set_status_where(id, HostStatus::Waiting, HostStatus::Cancelled);
                for doing in state
                    .doing
                    .iter_mut()
                    .filter(|d| d.id == id && d.action != DoingAction::Kill)
                {
                    doing.action = DoingAction::Kill;
                    doing.clock = clock;
                }
                state.set_status_where(id, HostStatus::Running, HostStatus::Killing);
            }
        }
        Ok(())
    }

    async fn complete_task(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.actions.remove(&id);
        state.schedulers.remove(&id);
        state.doing.retain(|d| d.id != id);
        Ok(())
    }

    async fn long_task_ids(&self, before: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .actions
            .values()
            .filter(|a| matches!(a.action, ActionKind::Start | ActionKind::Pause))
            .filter(|a| {
                state
                    .metas
                    .get(&a.id)
                    .is_some_and(|m| m.created_at < before)
            })
            .map(|a| a.id)
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn task_hosts(&self, id: i64) -> Result<Vec<TaskHost>> {
        Ok(self.state.lock().await.host_rows(id).cloned().collect())
    }

    async fn task_host(&self, id: i64, host: &str) -> Result<Option<TaskHost>> {
        Ok(self
            .state
            .lock()
            .await
            .host_rows(id)
            .find(|row| row.host == host)
            .cloned())
    }

    async fn waiting_host_count(&self, id: i64) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .host_rows(id)
            .filter(|row| row.status == HostStatus::Waiting)
            .count() as u64)
    }

    async fn waiting_hosts(&self, id: i64, limit: u64) -> Result<Vec<TaskHost>> {
        let state = self.state.lock().await;
        Ok(state
            .host_rows(id)
            .filter(|row| row.status == HostStatus::Waiting)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn unexpected_host_count(&self, id: i64) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .host_rows(id)
            .filter(|row| row.status.is_unexpected())
            .count() as u64)
    }

    async fn run_waiting_hosts(&self, id: i64, hosts: &[String], clock: i64) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        if !state.actions.contains_key(&id) {
            return Ok(Vec::new());
        }

        let mut released = Vec::with_capacity(hosts.len());
        for host in hosts {
            let Some(row) = state.host_mut(id, host) else {
                continue;
            };
            if row.status != HostStatus::Waiting {
                continue;
            }
            row.status = HostStatus::Running;
            state.upsert_doing(id, host, clock, DoingAction::Start);
            released.push(host.clone());
        }
        Ok(released)
    }

    async fn mark_timeout(&self, id: i64, host: &str, clock: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(pos) = state
            .doing
            .iter()
            .position(|d| d.id == id && d.host == host && d.clock == clock)
        else {
            return Ok(false);
        };
        state.doing.remove(pos);
        if let Some(row) = state.host_mut(id, host) {
            row.status = HostStatus::Timeout;
        }
        Ok(true)
    }

    async fn redo_host(&self, id: i64, host: &str, action: DoingAction, clock: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let status = match action {
            DoingAction::Start => HostStatus::Running,
            DoingAction::Kill => HostStatus::Killing,
        };
        match state.host_mut(id, host) {
            Some(row) => row.status = status,
            None => {
                return Err(DispatchError::HostNotFound {
                    id,
                    host: host.to_string(),
                })
            }
        }
        state.upsert_doing(id, host, clock, action);
        Ok(())
    }

    async fn ignore_host(&self, id: i64, host: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.host_mut(id, host) {
            Some(row) => row.status = HostStatus::Ignored,
            None => {
                return Err(DispatchError::HostNotFound {
                    id,
                    host: host.to_string(),
                })
            }
        }
        state.doing.retain(|d| !(d.id == id && d.host == host));
        Ok(())
    }
}
