use std::collections::BTreeMap;
use std::net::SocketAddr;

use uuid::Uuid;

/// Configuration for Docker-based task execution on a node.
///
/// When `enabled` is false, task commands run directly via `sh -c`.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Run tasks inside a Docker container
    pub enabled: bool,
    /// Docker image to use for task execution
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Placement settings for the dispatch loop and matcher.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long the dispatch loop sleeps when nothing could be matched,
    /// unless it is woken earlier.
    pub idle_wait_ms: u64,
    /// Prefer a qualifying local node over any other candidate.
    pub local_node_bias: bool,
    /// Peer drivers are skipped once this many real nodes are connected.
    pub peer_load_balance_threshold: usize,
    /// Allow dispatching to peer drivers that report no attached node.
    pub dispatch_to_peers_without_nodes: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: 1000,
            local_node_bias: true,
            peer_load_balance_threshold: usize::MAX,
            dispatch_to_peers_without_nodes: false,
        }
    }
}

/// Load-balancing algorithm selection.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// "manual" or "adaptive"
    pub algorithm: String,
    /// Fixed size for "manual", initial size for "adaptive"
    pub size: usize,
    /// Target round-trip duration of one bundle for "adaptive"
    pub target_bundle_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: "manual".to_string(),
            size: 5,
            target_bundle_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub uuid: String,
    /// Address the node server listens on
    pub node_listen_addr: SocketAddr,
    /// Address of the management dashboard, if enabled
    pub dashboard_addr: Option<SocketAddr>,
    pub scheduler: SchedulerConfig,
    pub balancer: BalancerConfig,
    pub queue_capacity: usize,
    /// Finished jobs kept queryable after completion, oldest evicted first
    pub finished_job_retention: usize,
    /// Concurrent bundles per node when the node does not say otherwise
    pub default_node_max_jobs: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            node_listen_addr: SocketAddr::from(([127, 0, 0, 1], 11111)),
            dashboard_addr: None,
            scheduler: SchedulerConfig::default(),
            balancer: BalancerConfig::default(),
            queue_capacity: 10_000,
            finished_job_retention: 1_000,
            default_node_max_jobs: 1,
        }
    }
}

impl DriverConfig {
    pub fn new(node_listen_addr: SocketAddr) -> Self {
        Self {
            node_listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_balancer(mut self, algorithm: &str, size: usize) -> Self {
        self.balancer.algorithm = algorithm.to_string();
        self.balancer.size = size;
        self
    }

    pub fn with_idle_wait_ms(mut self, idle_wait_ms: u64) -> Self {
        self.scheduler.idle_wait_ms = idle_wait_ms;
        self
    }
}

/// Configuration of a node agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Driver node-server address, host:port
    pub driver_addr: String,
    pub uuid: String,
    pub max_jobs: usize,
    /// Disconnect after receiving work and reconnect to deliver results
    pub offline: bool,
    pub local: bool,
    pub peer: bool,
    pub provisioning_master: bool,
    pub provisioning_slave: bool,
    /// Extra properties published in the node's system information
    pub properties: BTreeMap<String, String>,
    pub reconnect_delay_ms: u64,
    pub management_port: Option<u16>,
    pub sandbox: SandboxConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            driver_addr: "127.0.0.1:11111".to_string(),
            uuid: Uuid::new_v4().to_string(),
            max_jobs: 1,
            offline: false,
            local: false,
            peer: false,
            provisioning_master: false,
            provisioning_slave: false,
            properties: BTreeMap::new(),
            reconnect_delay_ms: 1000,
            management_port: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(driver_addr: impl Into<String>) -> Self {
        Self {
            driver_addr: driver_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.image, "alpine:latest");
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.idle_wait_ms, 1000);
        assert!(cfg.local_node_bias);
        assert_eq!(cfg.peer_load_balance_threshold, usize::MAX);
        assert!(!cfg.dispatch_to_peers_without_nodes);
    }

    #[test]
    fn driver_config_default() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.node_listen_addr.to_string(), "127.0.0.1:11111");
        assert!(cfg.dashboard_addr.is_none());
        assert_eq!(cfg.balancer.algorithm, "manual");
        assert_eq!(cfg.balancer.size, 5);
        assert_eq!(cfg.queue_capacity, 10_000);
        assert_eq!(cfg.finished_job_retention, 1_000);
        assert_eq!(cfg.default_node_max_jobs, 1);
        assert!(Uuid::parse_str(&cfg.uuid).is_ok());
    }

    #[test]
    fn driver_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let dash: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let cfg = DriverConfig::new(addr)
            .with_dashboard(dash)
            .with_balancer("adaptive", 3)
            .with_idle_wait_ms(50);
        assert_eq!(cfg.node_listen_addr, addr);
        assert_eq!(cfg.dashboard_addr, Some(dash));
        assert_eq!(cfg.balancer.algorithm, "adaptive");
        assert_eq!(cfg.balancer.size, 3);
        assert_eq!(cfg.scheduler.idle_wait_ms, 50);
    }

    #[test]
    fn agent_config_builders() {
        let cfg = AgentConfig::new("driver.example.com:11111")
            .with_max_jobs(4)
            .with_property("cpu.cores", "16")
            .with_offline(true);
        assert_eq!(cfg.driver_addr, "driver.example.com:11111");
        assert_eq!(cfg.max_jobs, 4);
        assert!(cfg.offline);
        assert_eq!(cfg.properties.get("cpu.cores").map(String::as_str), Some("16"));
    }
}
