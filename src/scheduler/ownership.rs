use std::sync::Arc;

use crate::error::Result;
use crate::replica::Identity;
use crate::scheduler::task::ActionKind;
use crate::store::SchedulerStore;

/// Moves task ownership between replicas.
///
/// Every move is a compare-and-set on `task_scheduler.scheduler`, so of any
/// set of replicas racing for the same `(id, expected)` at most one wins.
pub struct OwnershipManager {
    store: Arc<dyn SchedulerStore>,
    me: Identity,
}

impl OwnershipManager {
    pub fn new(store: Arc<dyn SchedulerStore>, me: Identity) -> Self {
        Self { store, me }
    }

    pub fn identity(&self) -> &Identity {
        &self.me
    }

    /// CAS the owner of `id` from `expected` to this replica.
    pub async fn take_over(&self, id: i64, expected: &str) -> Result<bool> {
        self.store
            .take_over_task(id, expected, self.me.as_str())
            .await
    }

    /// Claim unowned tasks that are still active and not paused.
    ///
    /// Returns the ids this replica won.
    pub async fn claim_orphans(&self) -> Result<Vec<i64>> {
        let mut claimed = Vec::new();

        for id in self.store.orphan_task_ids().await? {
            let Some(action) = self.store.task_action(id).await? else {
                continue;
            };
            if action.action == ActionKind::Pause {
                continue;
            }

            if self.take_over(id, "").await? {
                tracing::info!(task_id = id, scheduler = %self.me, "Claimed orphan task");
                claimed.push(id);
            }
        }

        Ok(claimed)
    }

    /// Take over the given tasks of a dead peer. Returns the ids this replica won.
    pub async fn take_over_dead(&self, dead: &str, ids: &[i64]) -> Result<Vec<i64>> {
        let mut taken = Vec::new();

        for &id in ids {
            if self.take_over(id, dead).await? {
                tracing::info!(
                    task_id = id,
                    from = %dead,
                    to = %self.me,
                    "Took over task from dead scheduler"
                );
                taken.push(id);
            }
        }

        Ok(taken)
    }

    /// Ids of every task currently owned by this replica.
    pub async fn owned_task_ids(&self) -> Result<Vec<i64>> {
        self.store.tasks_of_scheduler(self.me.as_str()).await
    }
}
