use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::SystemInfo;
use crate::scheduler::job::Metadata;

/// What a node announces about itself when it connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub node_uuid: String,
    #[serde(default)]
    pub system_info: SystemInfo,
    #[serde(default)]
    pub management_host: Option<String>,
    #[serde(default)]
    pub management_port: Option<u16>,
    #[serde(default)]
    pub peer: bool,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub offline: bool,
    #[serde(default = "accepting_default")]
    pub accepting_new_jobs: bool,
    #[serde(default)]
    pub provisioning_master: bool,
    #[serde(default)]
    pub provisioning_slave: bool,
    /// Concurrent units the node is willing to run
    #[serde(default)]
    pub max_jobs: Option<usize>,
    /// Results of a unit taken while offline, carried in the message segments
    #[serde(default)]
    pub reopen: Option<ReopenInfo>,
}

fn accepting_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReopenInfo {
    pub result: ResultHeader,
    /// Close the connection once the results are processed
    #[serde(default)]
    pub close_after: bool,
}

/// Header of a unit sent to a node. Segment 1 is the job's shared data,
/// segments 2.. are the task payloads in `positions` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchHeader {
    pub job_uuid: Uuid,
    pub bundle_id: u64,
    pub job_name: String,
    pub positions: Vec<usize>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub uuid_path: Vec<String>,
}

/// Header of a returned unit. Segments 1.. are task results in dispatch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultHeader {
    pub job_uuid: Uuid,
    pub bundle_id: u64,
    /// Error that prevented the node from processing the unit
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub resubmit_positions: Option<Vec<usize>>,
    #[serde(default)]
    pub node_elapsed_ms: Option<u64>,
    /// Put the whole unit back in the queue
    #[serde(default)]
    pub requeue: bool,
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default)]
    pub system_info: Option<SystemInfo>,
}

impl ResultHeader {
    pub fn new(job_uuid: Uuid, bundle_id: u64) -> Self {
        Self {
            job_uuid,
            bundle_id,
            ..Default::default()
        }
    }
}

/// Node reconfiguration sent when a node is reserved for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconfigureHeader {
    pub properties: SystemInfo,
    /// Reconnect with the new properties instead of applying them in place
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Header {
    HandshakeRequest { driver_uuid: String },
    Handshake(HandshakeInfo),
    Dispatch(DispatchHeader),
    Result(ResultHeader),
    /// Throttling signal from the node
    Notification { accepting_new_jobs: bool },
    Reconfigure(ReconfigureHeader),
    Cancel { job_uuid: Uuid, bundle_id: u64 },
}

impl Header {
    pub fn kind(&self) -> &'static str {
        match self {
            Header::HandshakeRequest { .. } => "handshake_request",
            Header::Handshake(_) => "handshake",
            Header::Dispatch(_) => "dispatch",
            Header::Result(_) => "result",
            Header::Notification { .. } => "notification",
            Header::Reconfigure(_) => "reconfigure",
            Header::Cancel { .. } => "cancel",
        }
    }
}

/// One wire message: a header plus independent payload segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub segments: Vec<Bytes>,
}

impl Message {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            segments: Vec::new(),
        }
    }

    pub fn with_segments(header: Header, segments: Vec<Bytes>) -> Self {
        Self { header, segments }
    }
}
