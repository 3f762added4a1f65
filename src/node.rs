use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::Admission;
use crate::cache::{Cache, MemoryCache, RedisCache};
use crate::center::CenterClient;
use crate::config::NodeConfig;
use crate::doing::{DoingCache, DoingProjector};
use crate::error::Result;
use crate::replica::{Heartbeat, Identity};
use crate::report::Reconciler;
use crate::rpc;
use crate::scheduler::{Dispatcher, LongTaskCleaner, OwnershipManager, Scheduler, TimeoutEnforcer};
use crate::store::{MemoryStore, PostgresStore, SchedulerStore, TaskStore};

/// One dispatcher replica: shared handles plus the periodic workers built on them.
pub struct Node {
    config: NodeConfig,
    identity: Identity,
    tasks: Arc<dyn TaskStore>,
    /// Set on the center only.
    scheduler_store: Option<Arc<dyn SchedulerStore>>,
    cache: Arc<dyn Cache>,
    doing: DoingCache,
    reconciler: Arc<Reconciler>,
    admission: Arc<Admission>,
}

impl Node {
    /// A center replica scheduling out of `store`.
    pub fn center<S>(
        config: NodeConfig,
        identity: Identity,
        store: Arc<S>,
        cache: Arc<dyn Cache>,
    ) -> Self
    where
        S: SchedulerStore + 'static,
    {
        let tasks: Arc<dyn TaskStore> = store.clone();
        let scheduler_store: Arc<dyn SchedulerStore> = store;
        let admission = Admission::center(
            scheduler_store.clone(),
            tasks.clone(),
            cache.clone(),
            config.schedule.meta_ttl,
        );
        Self::assemble(config, identity, tasks, Some(scheduler_store), cache, admission)
    }

    /// An edge replica forwarding durable operations to `center`.
    pub fn edge(
        config: NodeConfig,
        identity: Identity,
        center: Arc<dyn TaskStore>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        let admission = Admission::edge(center.clone(), cache.clone(), config.schedule.meta_ttl);
        Self::assemble(config, identity, center, None, cache, admission)
    }

    fn assemble(
        config: NodeConfig,
        identity: Identity,
        tasks: Arc<dyn TaskStore>,
        scheduler_store: Option<Arc<dyn SchedulerStore>>,
        cache: Arc<dyn Cache>,
        admission: Admission,
    ) -> Self {
        let doing = DoingCache::new();
        let reconciler = Arc::new(Reconciler::new(
            tasks.clone(),
            cache.clone(),
            doing.clone(),
            config.continuous_output,
            config.schedule.meta_ttl,
        ));
        Self {
            config,
            identity,
            tasks,
            scheduler_store,
            cache,
            doing,
            reconciler,
            admission: Arc::new(admission),
        }
    }

    /// Build a replica from its configuration, connecting to the store, cache
    /// or center it names. Unset DSNs fall back to in-memory backends.
    pub async fn connect(config: NodeConfig) -> Result<Self> {
        let identity = Identity::resolve(config.ip.as_deref(), config.listen_addr.port())?;

        let cache: Arc<dyn Cache> = match &config.redis_url {
            Some(url) => Arc::new(RedisCache::connect(url).await?),
            None => {
                tracing::warn!("No redis url configured, using in-memory cache");
                Arc::new(MemoryCache::new())
            }
        };
        cache.init_id_generator().await?;

        if !config.is_center {
            let center: Arc<dyn TaskStore> = Arc::new(CenterClient::new(&config.center)?);
            tracing::info!(scheduler = %identity, centers = ?config.center.addrs, "Starting edge replica");
            return Ok(Self::edge(config, identity, center, cache));
        }

        tracing::info!(scheduler = %identity, "Starting center replica");
        match &config.database_url {
            Some(dsn) => {
                let store =
                    Arc::new(PostgresStore::connect(dsn, config.database_max_connections).await?);
                Ok(Self::center(config, identity, store, cache))
            }
            None => {
                tracing::warn!("No database url configured, using in-memory store");
                Ok(Self::center(config, identity, Arc::new(MemoryStore::new()), cache))
            }
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_center(&self) -> bool {
        self.scheduler_store.is_some()
    }

    pub fn admission(&self) -> Arc<Admission> {
        self.admission.clone()
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    pub fn doing(&self) -> &DoingCache {
        &self.doing
    }

    pub fn router(&self) -> Router {
        rpc::router(self.reconciler.clone(), self.scheduler_store.clone())
    }

    /// Run every worker of this replica and serve RPC on `listener`.
    ///
    /// Workers and the server stop when `shutdown` is cancelled; this returns
    /// once all of them have finished.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let schedule = self.config.schedule.clone();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        let projector = DoingProjector::new(self.tasks.clone(), self.cache.clone(), self.doing.clone());
        workers.push(tokio::spawn(
            projector.run(Duration::from_millis(schedule.projector_ms), shutdown.clone()),
        ));

        workers.push(tokio::spawn(self.reconciler.clone().run_result_flusher(
            Duration::from_millis(schedule.result_flush_ms),
            shutdown.clone(),
        )));

        if let Some(store) = &self.scheduler_store {
            let ownership = Arc::new(OwnershipManager::new(store.clone(), self.identity.clone()));

            let heartbeat = Heartbeat::new(
                store.clone(),
                ownership.clone(),
                self.config.heartbeat.clone(),
            );
            workers.push(tokio::spawn(heartbeat.run(shutdown.clone())));

            let scheduler = Scheduler::new(
                ownership,
                TimeoutEnforcer::new(store.clone(), self.cache.clone(), schedule.meta_ttl),
                Dispatcher::new(store.clone(), self.cache.clone(), schedule.meta_ttl),
            );
            workers.push(tokio::spawn(
                scheduler.run(Duration::from_millis(schedule.tick_ms), shutdown.clone()),
            ));

            let cleaner = LongTaskCleaner::new(
                store.clone(),
                schedule.long_task_retention,
                schedule.long_task_limit,
            );
            workers.push(tokio::spawn(
                cleaner.run(schedule.cleaner_interval, shutdown.clone()),
            ));
        }

        let served = rpc::serve(listener, self.router(), shutdown.clone()).await;
        // A failed server takes the workers down with it.
        shutdown.cancel();

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        tracing::info!(scheduler = %self.identity, "Replica stopped");
        served
    }
}
