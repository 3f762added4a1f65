//! Key/value cache in front of the store.
//!
//! Holds three things: `task:meta:<id>` (JSON [`TaskMeta`] with a TTL), the
//! hash `ibex-host-doing` (field `<host>:<id>` -> JSON [`TaskHostDoing`]) used
//! by alert-triggered edge tasks, and the `id` counter minting edge task ids.

mod memory;
mod redis_cache;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::task::{TaskHostDoing, TaskMeta};
use crate::store::TaskStore;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

/// Seed of the edge id generator. Ids at or above this were minted locally.
pub const ID_INITIAL: i64 = 1 << 32;

pub const ID_KEY: &str = "id";

pub const HOST_DOING_KEY: &str = "ibex-host-doing";

/// Default TTL of cached task metas.
pub const META_TTL: Duration = Duration::from_secs(3600);

pub fn task_meta_key(id: i64) -> String {
    format!("task:meta:{id}")
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_meta(&self, id: i64) -> Result<Option<TaskMeta>>;

    async fn set_meta(&self, meta: &TaskMeta, ttl: Duration) -> Result<()>;

    async fn delete_meta(&self, id: i64) -> Result<()>;

    /// Every entry of the `ibex-host-doing` hash. Undecodable values are skipped.
    async fn host_doing_all(&self) -> Result<Vec<TaskHostDoing>>;

    /// Write the meta and its doing entry in one atomic step.
    async fn cache_task(&self, meta: &TaskMeta, doing: &TaskHostDoing, ttl: Duration) -> Result<()>;

    /// Remove `<host>:<id>` from the doing hash. Returns whether it was present.
    async fn remove_host_doing(&self, host: &str, id: i64) -> Result<bool>;

    /// Seed the id counter at [`ID_INITIAL`] unless it already exists.
    async fn init_id_generator(&self) -> Result<()>;

    async fn next_id(&self) -> Result<i64>;
}

/// Read a task meta through the cache: cache, then store, then write-through.
///
/// Cache failures are logged and fall through to the store.
pub async fn task_meta_by_id<C, S>(
    cache: &C,
    store: &S,
    id: i64,
    ttl: Duration,
) -> Result<Option<TaskMeta>>
where
    C: Cache + ?Sized,
    S: TaskStore + ?Sized,
{
    match cache.get_meta(id).await {
        Ok(Some(meta)) => return Ok(Some(meta)),
        Ok(None) => {}
        Err(e) => tracing::warn!(task_id = id, error = %e, "Meta cache read failed"),
    }

    let Some(meta) = store.task_meta(id).await? else {
        return Ok(None);
    };

    if let Err(e) = cache.set_meta(&meta, ttl).await {
        tracing::warn!(task_id = id, error = %e, "Meta cache write failed");
    }
    Ok(Some(meta))
}
