use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CPU_CORES: &str = "cpu.cores";
pub const OS_NAME: &str = "os.name";
pub const OS_ARCH: &str = "os.arch";
pub const HOST_NAME: &str = "host.name";
pub const NODE_UUID: &str = "grid.node.uuid";
pub const NODE_MAX_JOBS: &str = "grid.node.max.jobs";
pub const PEER_DRIVER: &str = "grid.peer.driver";
pub const PEER_TOTAL_NODES: &str = "grid.peer.total.nodes";
pub const PROVISIONING_MASTER: &str = "grid.provisioning.master";
pub const PROVISIONING_SLAVE: &str = "grid.provisioning.slave";
pub const PROVISIONING_MASTER_UUID: &str = "grid.provisioning.master.uuid";
pub const NODE_RESERVED_JOB: &str = "grid.node.reserved.job";
pub const NODE_RESERVED_UUID: &str = "grid.node.reserved.uuid";

/// String-keyed property bag describing a node (or the driver itself).
///
/// Values are stored as strings and parsed on demand, so the same bag can be
/// sent over the wire, matched by policies and compared for configuration
/// distance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemInfo {
    props: BTreeMap<String, String>,
}

impl SystemInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(props: BTreeMap<String, String>) -> Self {
        Self { props }
    }

    /// Snapshot of the host this process runs on.
    pub fn local_host() -> Self {
        let mut info = Self::new();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        info.set(CPU_CORES, cores);
        info.set(OS_NAME, std::env::consts::OS);
        info.set(OS_ARCH, std::env::consts::ARCH);
        if let Ok(host) = std::env::var("HOSTNAME") {
            info.set(HOST_NAME, host);
        }
        info
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.props.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.props.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Copy every property of `other` into this bag, overwriting duplicates.
    pub fn merge(&mut self, other: &SystemInfo) {
        for (k, v) in &other.props {
            self.props.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}
