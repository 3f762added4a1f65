use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ibex_dispatch::config::{CenterConfig, HeartbeatConfig, NodeConfig};
use ibex_dispatch::node::Node;
use ibex_dispatch::shutdown::install_shutdown_handler;
use ibex_dispatch::store::PostgresStore;

#[derive(Parser, Debug)]
#[command(name = "ibex-dispatch")]
#[command(version)]
#[command(about = "Scheduling and dispatch engine for remote script execution")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a dispatcher replica
    Server(ServerArgs),

    /// Create the store schema and exit
    Migrate {
        /// PostgreSQL connection string
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to serve the agent RPC on
    #[arg(long, default_value = "0.0.0.0:10090")]
    listen: SocketAddr,

    /// IP part of this replica's scheduler identity (autodetected when unset)
    #[arg(long, env = "IBEX_IP")]
    ip: Option<String>,

    /// Run as an edge replica forwarding to the center API
    #[arg(long)]
    edge: bool,

    /// Center API base URLs, comma-separated (edge only)
    #[arg(long, env = "IBEX_CENTER_API", value_delimiter = ',', required_if_eq("edge", "true"))]
    center_api: Vec<String>,

    /// Basic auth user for the center API
    #[arg(long, env = "IBEX_CENTER_USER", requires = "center_pass")]
    center_user: Option<String>,

    /// Basic auth password for the center API
    #[arg(long, env = "IBEX_CENTER_PASS", requires = "center_user")]
    center_pass: Option<String>,

    /// Timeout of center API requests, in milliseconds
    #[arg(long, default_value = "5000")]
    center_timeout_ms: u64,

    /// PostgreSQL connection string (center only)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum PostgreSQL connections
    #[arg(long, default_value = "10")]
    database_max_connections: u32,

    /// Redis connection string
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Use in-memory store and cache (single replica, nothing persisted)
    #[arg(long, conflicts_with_all = ["database_url", "redis_url", "edge"])]
    in_memory: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,
}

impl ServerArgs {
    fn into_config(self) -> Result<NodeConfig, Box<dyn std::error::Error>> {
        if !self.in_memory && !self.edge && self.database_url.is_none() {
            return Err("--database-url is required unless --in-memory or --edge is given".into());
        }

        let mut config = NodeConfig::new(self.listen);
        config.ip = self.ip;
        config.heartbeat = HeartbeatConfig {
            interval_ms: self.heartbeat_ms,
            ..HeartbeatConfig::default()
        };
        config.database_url = self.database_url;
        config.database_max_connections = self.database_max_connections;
        config.redis_url = self.redis_url;
        config.continuous_output = std::env::var("CONTINUOUS_OUTPUT").as_deref() == Ok("1");

        if self.edge {
            let mut center = CenterConfig {
                timeout: Duration::from_millis(self.center_timeout_ms),
                ..CenterConfig::default()
            }
            .with_addrs(self.center_api);
            if let (Some(user), Some(pass)) = (self.center_user, self.center_pass) {
                center = center.with_basic_auth(user, pass);
            }
            config = config.edge(center);
        }

        Ok(config)
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        center = config.is_center,
        continuous_output = config.continuous_output,
        "Starting ibex-dispatch replica"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let node = Node::connect(config).await?;
    let shutdown = install_shutdown_handler();
    node.run(listener, shutdown).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Migrate { database_url } => {
            PostgresStore::connect(&database_url, 1).await?;
            tracing::info!("Migrations applied");
        }
    }

    Ok(())
}
