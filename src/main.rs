use std::collections::BTreeMap;
use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use gridlite::config::{AgentConfig, DriverConfig, SandboxConfig};
use gridlite::shutdown::install_shutdown_handler;
use gridlite::worker::NodeAgent;
use gridlite::Driver;

#[derive(Parser, Debug)]
#[command(name = "gridlite")]
#[command(version)]
#[command(about = "A job-execution grid: dispatch driver and node agent")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a driver
    Driver(DriverArgs),

    /// Start a node agent connected to a driver
    Node(NodeArgs),
}

#[derive(Debug, Clone, ValueEnum)]
enum Balancer {
    Manual,
    Adaptive,
}

impl Balancer {
    fn as_str(&self) -> &'static str {
        match self {
            Balancer::Manual => "manual",
            Balancer::Adaptive => "adaptive",
        }
    }
}

// =============================================================================
// Driver Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DriverArgs {
    /// Driver uuid (random when omitted)
    #[arg(long)]
    uuid: Option<String>,

    /// Port nodes connect to
    #[arg(long, default_value = "11111")]
    port: u16,

    /// Port for the management dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Load-balancing algorithm
    #[arg(long, value_enum, default_value = "manual")]
    balancer: Balancer,

    /// Bundle size ("manual") or initial bundle size ("adaptive")
    #[arg(long, default_value = "5")]
    bundle_size: usize,

    /// How long the dispatch loop waits when nothing matched, in ms
    #[arg(long, default_value = "1000")]
    idle_wait_ms: u64,

    /// Do not prefer local nodes
    #[arg(long)]
    no_local_bias: bool,

    /// Finished jobs kept for the dashboard before the oldest are dropped
    #[arg(long, default_value = "1000")]
    finished_job_retention: usize,

    /// Concurrent units per node when the node does not say otherwise
    #[arg(long, default_value = "1")]
    default_node_max_jobs: usize,
}

// =============================================================================
// Node Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Driver address, host:port
    #[arg(long, default_value = "127.0.0.1:11111")]
    driver: String,

    /// Node uuid (random when omitted)
    #[arg(long)]
    uuid: Option<String>,

    /// Concurrent units this node runs
    #[arg(long, default_value = "1")]
    max_jobs: usize,

    /// Disconnect after receiving a unit, reconnect to deliver its results
    #[arg(long)]
    offline: bool,

    /// Mark the node as local to the driver
    #[arg(long)]
    local: bool,

    /// Extra system property, format "key=value" (repeatable)
    #[arg(long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Delay between reconnection attempts, in ms
    #[arg(long, default_value = "1000")]
    reconnect_delay_ms: u64,

    /// Run tasks inside a Docker container
    #[arg(long)]
    sandbox: bool,

    /// Docker image used by the sandbox
    #[arg(long, default_value = "alpine:latest")]
    image: String,
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid property '{}', expected key=value", s)),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_driver(args: DriverArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut config = DriverConfig::new(listen_addr)
        .with_balancer(args.balancer.as_str(), args.bundle_size)
        .with_idle_wait_ms(args.idle_wait_ms);
    if let Some(port) = args.dashboard_port {
        config = config.with_dashboard(format!("0.0.0.0:{}", port).parse()?);
    }
    if let Some(uuid) = args.uuid {
        config.uuid = uuid;
    }
    config.scheduler.local_node_bias = !args.no_local_bias;
    config.default_node_max_jobs = args.default_node_max_jobs.max(1);
    config.finished_job_retention = args.finished_job_retention;

    tracing::info!(
        uuid = %config.uuid,
        listen_addr = %config.node_listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        "Starting gridlite driver"
    );

    let shutdown = install_shutdown_handler("driver");
    Driver::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AgentConfig::new(args.driver)
        .with_max_jobs(args.max_jobs.max(1))
        .with_offline(args.offline);
    if let Some(uuid) = args.uuid {
        config.uuid = uuid;
    }
    config.local = args.local;
    config.reconnect_delay_ms = args.reconnect_delay_ms;
    config.properties = args.properties.into_iter().collect::<BTreeMap<_, _>>();
    config.sandbox = SandboxConfig {
        enabled: args.sandbox,
        image: args.image,
        ..SandboxConfig::default()
    };

    let shutdown = install_shutdown_handler("node");
    NodeAgent::new(config).run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Driver(args) => run_driver(args).await,
        Commands::Node(args) => run_node(args).await,
    }
}
