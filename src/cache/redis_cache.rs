use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{task_meta_key, Cache, HOST_DOING_KEY, ID_INITIAL, ID_KEY};
use crate::error::Result;
use crate::scheduler::task::{host_doing_field, TaskHostDoing, TaskMeta};

/// Redis-backed cache over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_meta(&self, id: i64) -> Result<Option<TaskMeta>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(task_meta_key(id)).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn set_meta(&self, meta: &TaskMeta, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(meta)?;
        let _: () = conn
            .set_ex(task_meta_key(meta.id), payload, ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn delete_meta(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(task_meta_key(id)).await?;
        Ok(())
    }

    async fn host_doing_all(&self) -> Result<Vec<TaskHostDoing>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.hvals(HOST_DOING_KEY).await?;
        let mut all = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_str::<TaskHostDoing>(&value) {
                Ok(doing) => all.push(doing),
                Err(e) => tracing::warn!(error = %e, value = %value, "Skipping undecodable host doing entry"),
            }
        }
        Ok(all)
    }

    async fn cache_task(&self, meta: &TaskMeta, doing: &TaskHostDoing, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let meta_json = serde_json::to_string(meta)?;
        let doing_json = serde_json::to_string(doing)?;
        let _: () = redis::pipe()
            .atomic()
            .set_ex(task_meta_key(meta.id), meta_json, ttl.as_secs())
            .ignore()
            .hset(HOST_DOING_KEY, doing.cache_field(), doing_json)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_host_doing(&self, host: &str, id: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(HOST_DOING_KEY, host_doing_field(host, id)).await?;
        Ok(removed > 0)
    }

    async fn init_id_generator(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let seeded: bool = conn.set_nx(ID_KEY, ID_INITIAL).await?;
        if seeded {
            tracing::info!(seed = ID_INITIAL, "Seeded edge id generator");
        }
        Ok(())
    }

    async fn next_id(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(ID_KEY, 1).await?)
    }
}
