use std::net::SocketAddr;
use std::time::Duration;

/// Replica liveness settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between `task_scheduler_health` upserts.
    pub interval_ms: u64,
    /// A peer is dead once its last heartbeat is this many intervals old.
    pub dead_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            dead_multiplier: 10,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Staleness, in whole seconds, after which a peer counts as dead. At least 1.
    pub fn dead_after_secs(&self) -> i64 {
        let millis = self.interval_ms.saturating_mul(u64::from(self.dead_multiplier));
        i64::try_from(millis / 1000).unwrap_or(i64::MAX).max(1)
    }
}

/// Cadences and bounds of the periodic workers.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub tick_ms: u64,
    pub projector_ms: u64,
    pub result_flush_ms: u64,
    pub cleaner_interval: Duration,
    /// Active tasks created longer ago than this are cancelled by the cleaner.
    pub long_task_retention: Duration,
    pub long_task_limit: i64,
    pub meta_ttl: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            projector_ms: 400,
            result_flush_ms: 2000,
            cleaner_interval: Duration::from_secs(24 * 3600),
            long_task_retention: Duration::from_secs(14 * 24 * 3600),
            long_task_limit: 100,
            meta_ttl: Duration::from_secs(3600),
        }
    }
}

/// Where an edge replica forwards durable operations.
#[derive(Debug, Clone)]
pub struct CenterConfig {
    /// Base URLs of the center API, tried in order.
    pub addrs: Vec<String>,
    pub basic_auth: Option<(String, String)>,
    pub timeout: Duration,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            basic_auth: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl CenterConfig {
    pub fn with_addrs(mut self, addrs: Vec<String>) -> Self {
        self.addrs = addrs;
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), pass.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the agent RPC (and, on the center, the forwarding API) binds to.
    pub listen_addr: SocketAddr,
    /// Outbound IP override. Autodetected when unset.
    pub ip: Option<String>,
    pub is_center: bool,
    pub heartbeat: HeartbeatConfig,
    pub schedule: ScheduleConfig,
    pub center: CenterConfig,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    /// Store `running` output reported by agents as it streams in.
    pub continuous_output: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 10090)),
            ip: None,
            is_center: true,
            heartbeat: HeartbeatConfig::default(),
            schedule: ScheduleConfig::default(),
            center: CenterConfig::default(),
            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            continuous_output: false,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Turn this replica into an edge forwarding to `center`.
    pub fn edge(mut self, center: CenterConfig) -> Self {
        self.is_center = false;
        self.center = center;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_config_default() {
        let cfg = HeartbeatConfig::default();
        assert_eq!(cfg.interval(), Duration::from_secs(1));
        assert_eq!(cfg.dead_after_secs(), 10);
    }

    #[test]
    fn dead_after_is_at_least_one_second() {
        let cfg = HeartbeatConfig {
            interval_ms: 20,
            dead_multiplier: 10,
        };
        assert_eq!(cfg.dead_after_secs(), 1);
    }

    #[test]
    fn schedule_config_default() {
        let cfg = ScheduleConfig::default();
        assert_eq!(cfg.tick_ms, 1000);
        assert_eq!(cfg.projector_ms, 400);
        assert_eq!(cfg.result_flush_ms, 2000);
        assert_eq!(cfg.cleaner_interval, Duration::from_secs(86_400));
        assert_eq!(cfg.long_task_retention, Duration::from_secs(14 * 86_400));
        assert_eq!(cfg.long_task_limit, 100);
        assert_eq!(cfg.meta_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:10090");
        assert!(cfg.is_center);
        assert!(cfg.ip.is_none());
        assert!(!cfg.continuous_output);
        assert!(cfg.center.addrs.is_empty());
    }

    #[test]
    fn node_config_edge() {
        let center = CenterConfig::default()
            .with_addrs(vec!["http://10.0.0.1:10090".to_string()])
            .with_basic_auth("ibex", "secret");
        let cfg = NodeConfig::new("127.0.0.1:20090".parse().unwrap())
            .edge(center)
            .with_ip("10.0.0.9");
        assert!(!cfg.is_center);
        assert_eq!(cfg.ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(cfg.center.addrs.len(), 1);
        assert_eq!(
            cfg.center.basic_auth,
            Some(("ibex".to_string(), "secret".to_string()))
        );
        assert_eq!(cfg.center.timeout, Duration::from_secs(5));
    }
}
