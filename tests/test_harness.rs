//! Test harness for dispatcher integration tests.
//!
//! Builds replicas wired to in-memory stores and caches. Replicas built on the
//! same `MemoryStore` behave like server replicas sharing one database.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ibex_dispatch::admission::{Admission, TaskForm};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::OnceCell;

use ibex_dispatch::cache::{Cache, MemoryCache, RedisCache};
use ibex_dispatch::config::HeartbeatConfig;
use ibex_dispatch::doing::{DoingCache, DoingProjector};
use ibex_dispatch::replica::{Heartbeat, Identity};
use ibex_dispatch::report::{Reconciler, ReportRequest, ReportResponse, ReportedTask};
use ibex_dispatch::scheduler::{
    Dispatcher, HostStatus, OwnershipManager, ScheduleOutcome, Scheduler, TimeoutEnforcer,
};
use ibex_dispatch::store::{run_migrations, DoingFilter, MemoryStore, PostgresStore, SchedulerStore, TaskStore};

pub const META_TTL: Duration = Duration::from_secs(3600);

static POSTGRES_MIGRATED: OnceCell<()> = OnceCell::const_new();

/// Store over `DATABASE_URL`, migrated once per test binary. `None` when unset.
pub async fn postgres_store() -> Option<Arc<PostgresStore>> {
    let Ok(dsn) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(15))
        .connect(&dsn)
        .await
        .unwrap_or_else(|err| panic!("connect to {dsn} failed: {err}"));
    POSTGRES_MIGRATED
        .get_or_init(|| async {
            run_migrations(&pool)
                .await
                .unwrap_or_else(|err| panic!("postgres migrations failed: {err}"))
        })
        .await;

    Some(Arc::new(PostgresStore::new(pool)))
}

/// Cache over `REDIS_URL`. `None` when unset.
pub async fn redis_cache() -> Option<Arc<RedisCache>> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping redis test");
        return None;
    };
    let cache = RedisCache::connect(&url)
        .await
        .unwrap_or_else(|err| panic!("connect to {url} failed: {err}"));
    cache.init_id_generator().await.expect("seed id generator");
    Some(Arc::new(cache))
}

/// Admission, dispatcher and timeout enforcer over any store and cache.
pub struct Engine {
    pub store: Arc<dyn SchedulerStore>,
    pub admission: Admission,
    pub dispatcher: Dispatcher,
    pub timeouts: TimeoutEnforcer,
}

impl Engine {
    pub fn new<S: SchedulerStore + 'static>(store: Arc<S>, cache: Arc<dyn Cache>) -> Self {
        let scheduler_store: Arc<dyn SchedulerStore> = store.clone();
        let tasks: Arc<dyn TaskStore> = store;
        Self {
            admission: Admission::center(
                scheduler_store.clone(),
                tasks,
                cache.clone(),
                META_TTL,
            ),
            dispatcher: Dispatcher::new(scheduler_store.clone(), cache.clone(), META_TTL),
            timeouts: TimeoutEnforcer::new(scheduler_store.clone(), cache, META_TTL),
            store: scheduler_store,
        }
    }
}

/// One center replica over a shared in-memory store.
pub struct TestReplica {
    pub identity: Identity,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub ownership: Arc<OwnershipManager>,
    pub heartbeat: Heartbeat,
    pub scheduler: Scheduler,
    pub admission: Admission,
    pub reconciler: Arc<Reconciler>,
    pub doing: DoingCache,
    projector: DoingProjector,
}

impl TestReplica {
    pub fn new(port: u16, store: Arc<MemoryStore>, cache: Arc<MemoryCache>) -> Self {
        Self::with_options(port, store, cache, false)
    }

    pub fn with_options(
        port: u16,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        continuous_output: bool,
    ) -> Self {
        let identity = Identity::new("10.0.0.1", port);
        let scheduler_store: Arc<dyn SchedulerStore> = store.clone();
        let tasks: Arc<dyn TaskStore> = store.clone();

        let ownership = Arc::new(OwnershipManager::new(
            scheduler_store.clone(),
            identity.clone(),
        ));
        let heartbeat = Heartbeat::new(
            scheduler_store.clone(),
            ownership.clone(),
            HeartbeatConfig::default(),
        );
        let scheduler = Scheduler::new(
            ownership.clone(),
            TimeoutEnforcer::new(scheduler_store.clone(), cache.clone(), META_TTL),
            Dispatcher::new(scheduler_store.clone(), cache.clone(), META_TTL),
        );
        let admission = Admission::center(
            scheduler_store,
            tasks.clone(),
            cache.clone(),
            META_TTL,
        );

        let doing = DoingCache::new();
        let reconciler = Arc::new(Reconciler::new(
            tasks.clone(),
            cache.clone(),
            doing.clone(),
            continuous_output,
            META_TTL,
        ));
        let projector = DoingProjector::new(tasks, cache.clone(), doing.clone());

        Self {
            identity,
            store,
            cache,
            ownership,
            heartbeat,
            scheduler,
            admission,
            reconciler,
            doing,
            projector,
        }
    }

    /// Single replica with its own store and cache.
    pub fn standalone() -> Self {
        Self::new(
            10090,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new()),
        )
    }

    /// Rebuild the doing cache from store and cache.
    pub async fn project(&mut self) {
        assert!(self.projector.refresh().await, "projection failed");
    }

    /// Heartbeat (claims orphans) then one scheduler pass.
    pub async fn tick(&self, now: i64) -> Vec<(i64, ScheduleOutcome)> {
        self.heartbeat.tick(now).await.expect("heartbeat tick");
        self.scheduler.tick(now).await.expect("scheduler tick")
    }

    pub async fn add(&self, form: &TaskForm, now: i64) -> i64 {
        self.admission.add_task(form, now).await.expect("add task")
    }

    pub async fn report(&self, host: &str, tasks: Vec<ReportedTask>) -> ReportResponse {
        self.reconciler
            .report(ReportRequest {
                ident: host.to_string(),
                report_tasks: tasks,
            })
            .await
    }
}

pub fn form(hosts: &[&str]) -> TaskForm {
    TaskForm {
        title: "restart nginx".to_string(),
        account: "root".to_string(),
        script: "systemctl restart nginx".to_string(),
        creator: "tester".to_string(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        ..TaskForm::default()
    }
}

pub fn reported(id: i64, clock: i64, status: &str) -> ReportedTask {
    ReportedTask {
        id,
        clock,
        status: status.to_string(),
        stdout: format!("{status} out"),
        stderr: String::new(),
    }
}

pub async fn statuses(store: &MemoryStore, id: i64) -> Vec<(String, HostStatus)> {
    store
        .task_hosts(id)
        .await
        .unwrap()
        .into_iter()
        .map(|h| (h.host, h.status))
        .collect()
}

pub async fn hosts_with(store: &MemoryStore, id: i64, status: HostStatus) -> Vec<String> {
    statuses(store, id)
        .await
        .into_iter()
        .filter(|(_, s)| *s == status)
        .map(|(h, _)| h)
        .collect()
}

/// Hosts with a `task_host_doing` row, sorted.
pub async fn doing_hosts(store: &MemoryStore, id: i64) -> Vec<String> {
    let mut hosts: Vec<String> = store
        .doing_records(&DoingFilter::task(id))
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.host)
        .collect();
    hosts.sort();
    hosts
}
