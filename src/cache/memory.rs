use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Cache, ID_INITIAL};
use crate::error::{DispatchError, Result};
use crate::scheduler::task::{host_doing_field, TaskHostDoing, TaskMeta};

#[derive(Debug, Default)]
struct CacheState {
    metas: HashMap<i64, (TaskMeta, Instant)>,
    host_doing: HashMap<String, TaskHostDoing>,
    id: Option<i64>,
}

/// In-process cache. Can be switched unavailable to simulate a cache outage.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    state: Arc<Mutex<CacheState>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DispatchError::Internal("cache unavailable".to_string()))
        }
    }

    /// Whether `task:meta:<id>` is present and unexpired.
    pub async fn has_meta(&self, id: i64) -> bool {
        let state = self.state.lock().await;
        state
            .metas
            .get(&id)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_meta(&self, id: i64) -> Result<Option<TaskMeta>> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.metas.get(&id) {
            Some((meta, expires)) if *expires > Instant::now() => Ok(Some(meta.clone())),
            Some(_) => {
                state.metas.remove(&id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_meta(&self, meta: &TaskMeta, ttl: Duration) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .await
            .metas
            .insert(meta.id, (meta.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete_meta(&self, id: i64) -> Result<()> {
        self.check()?;
        self.state.lock().await.metas.remove(&id);
        Ok(())
    }

    async fn host_doing_all(&self) -> Result<Vec<TaskHostDoing>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut all: Vec<TaskHostDoing> = state.host_doing.values().cloned().collect();
        all.sort_by(|a, b| (a.id, &a.host).cmp(&(b.id, &b.host)));
        Ok(all)
    }

    async fn cache_task(&self, meta: &TaskMeta, doing: &TaskHostDoing, ttl: Duration) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state
            .metas
            .insert(meta.id, (meta.clone(), Instant::now() + ttl));
        state.host_doing.insert(doing.cache_field(), doing.clone());
        Ok(())
    }

    async fn remove_host_doing(&self, host: &str, id: i64) -> Result<bool> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .await
            .host_doing
            .remove(&host_doing_field(host, id))
            .is_some())
    }

    async fn init_id_generator(&self) -> Result<()> {
        self.check()?;
        self.state.lock().await.id.get_or_insert(ID_INITIAL);
        Ok(())
    }

    async fn next_id(&self) -> Result<i64> {
        self.check()?;
        let mut state = self.state.lock().await;
        let id = state.id.get_or_insert(0);
        *id += 1;
        Ok(*id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::DoingAction;

    #[tokio::test]
    async fn id_generator_seeds_once() {
        let cache = MemoryCache::new();
        cache.init_id_generator().await.unwrap();
        assert_eq!(cache.next_id().await.unwrap(), ID_INITIAL + 1);
        cache.init_id_generator().await.unwrap();
        assert_eq!(cache.next_id().await.unwrap(), ID_INITIAL + 2);
    }

    #[tokio::test]
    async fn expired_meta_is_gone() {
        let cache = MemoryCache::new();
        let mut meta = TaskMeta::new("t", "root", "id");
        meta.id = 3;
        cache.set_meta(&meta, Duration::ZERO).await.unwrap();
        assert!(cache.get_meta(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_host_doing_reports_presence() {
        let cache = MemoryCache::new();
        let mut meta = TaskMeta::new("t", "root", "id");
        meta.id = ID_INITIAL + 1;
        let doing = TaskHostDoing::new(meta.id, "h1", 10, DoingAction::Start);
        cache
            .cache_task(&meta, &doing, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.host_doing_all().await.unwrap(), vec![doing]);
        assert!(cache.remove_host_doing("h1", meta.id).await.unwrap());
        assert!(!cache.remove_host_doing("h1", meta.id).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_cache_errors() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        assert!(cache.host_doing_all().await.is_err());
        assert!(cache.next_id().await.is_err());
    }
}
