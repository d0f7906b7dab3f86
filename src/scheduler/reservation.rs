//! Node reservations for jobs that declare a desired node configuration.
//!
//! A reservation starts `pending` when the matcher picks a node whose
//! configuration does not match yet: the node is sent a `Reconfigure`
//! message and either applies it in place or restarts with the new
//! properties. It becomes `ready` when the node comes back idle carrying the
//! reserved job uuid in its properties.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::channel::{ChannelState, NodeChannel};
use crate::policy::system_info::{NODE_RESERVED_JOB, NODE_RESERVED_UUID};
use crate::policy::SystemInfo;
use crate::scheduler::job::Job;
use crate::transport::message::{Header, Message, ReconfigureHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Pending,
    Ready,
    None,
}

#[derive(Debug, Default)]
struct Ledger {
    pending: HashMap<String, Uuid>,
    ready: HashMap<String, Uuid>,
    job_pending: HashMap<Uuid, HashSet<String>>,
    job_ready: HashMap<Uuid, HashSet<String>>,
}

fn unlink(map: &mut HashMap<Uuid, HashSet<String>>, job: &Uuid, node: &str) {
    if let Some(nodes) = map.get_mut(job) {
        nodes.remove(node);
        if nodes.is_empty() {
            map.remove(job);
        }
    }
}

impl Ledger {
    fn remove_node(&mut self, node: &str) {
        if let Some(job) = self.pending.remove(node) {
            unlink(&mut self.job_pending, &job, node);
        }
        if let Some(job) = self.ready.remove(node) {
            unlink(&mut self.job_ready, &job, node);
        }
    }

    fn transition(&mut self, node: &str, info: &SystemInfo) -> bool {
        let Some(reserved_job) = info
            .get(NODE_RESERVED_JOB)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return false;
        };
        let old_node = info.get(NODE_RESERVED_UUID).unwrap_or(node).to_string();
        if self.pending.get(&old_node) != Some(&reserved_job) {
            return false;
        }
        self.pending.remove(&old_node);
        unlink(&mut self.job_pending, &reserved_job, &old_node);
        self.ready.insert(node.to_string(), reserved_job);
        self.job_ready
            .entry(reserved_job)
            .or_default()
            .insert(node.to_string());
        true
    }
}

/// Serializable view of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReservationsView {
    pub pending_jobs: BTreeSet<Uuid>,
    pub ready_jobs: BTreeSet<Uuid>,
    pub pending_nodes: BTreeSet<String>,
    pub ready_nodes: BTreeSet<String>,
}

/// Tracks which nodes are held for which desired-configuration job.
#[derive(Debug, Default)]
pub struct ReservationLedger {
    inner: Mutex<Ledger>,
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `channel` for `job` and send it the desired configuration.
    ///
    /// Called with the channel lock held. The node restarts when the SLA
    /// forces it or when its last computed distance is non-zero; otherwise the
    /// properties are applied in place and the reservation is ready at once.
    /// Returns whether the reservation became ready during this call.
    pub async fn do_reservation(&self, job: &Job, channel: &NodeChannel, state: &mut ChannelState) -> bool {
        let Some(desired) = job.sla().desired_configuration.as_ref() else {
            return false;
        };
        let node = channel.uuid().to_string();
        tracing::debug!(node = %node, job = %job.uuid(), "Reserving node");
        {
            let mut ledger = self.inner.lock().await;
            ledger.remove_node(&node);
            ledger.pending.insert(node.clone(), job.uuid());
            ledger.job_pending.entry(job.uuid()).or_default().insert(node.clone());
        }

        let mut properties = desired.properties.clone();
        properties.set(NODE_RESERVED_JOB, job.uuid());
        properties.set(NODE_RESERVED_UUID, &node);
        let restart = desired.force_restart || state.reservation_score > 0;
        state.keep_reservation = true;
        let mut ready = false;
        if !restart {
            state.system_info.merge(&properties);
            ready = self.transition_reservation(&node, &state.system_info).await;
            if ready {
                state.keep_reservation = false;
            }
        }

        let message = Message::new(Header::Reconfigure(ReconfigureHeader { properties, restart }));
        if let Err(e) = channel.send(message) {
            tracing::error!(node = %node, job = %job.uuid(), error = %e, "Failed to reserve node");
        }
        ready
    }

    /// Promote a pending reservation to ready for a node that came back with
    /// the reserved job in its properties.
    pub async fn transition_reservation(&self, node_uuid: &str, info: &SystemInfo) -> bool {
        let done = self.inner.lock().await.transition(node_uuid, info);
        if done {
            tracing::debug!(node = %node_uuid, "Node reservation ready");
        }
        done
    }

    pub async fn remove_reservation(&self, node_uuid: &str) {
        self.inner.lock().await.remove_node(node_uuid);
    }

    /// Drop every reservation held for a job, e.g. once it is cancelled.
    pub async fn remove_job_reservations(&self, job_uuid: &Uuid) {
        let mut ledger = self.inner.lock().await;
        if let Some(nodes) = ledger.job_pending.remove(job_uuid) {
            for node in nodes {
                ledger.pending.remove(&node);
            }
        }
        if let Some(nodes) = ledger.job_ready.remove(job_uuid) {
            for node in nodes {
                ledger.ready.remove(&node);
            }
        }
    }

    pub async fn ready_nodes(&self, job_uuid: &Uuid) -> Option<HashSet<String>> {
        self.inner.lock().await.job_ready.get(job_uuid).cloned()
    }

    pub async fn has_ready_node(&self, job_uuid: &Uuid) -> bool {
        self.inner.lock().await.job_ready.contains_key(job_uuid)
    }

    pub async fn pending_job_uuid(&self, node_uuid: &str) -> Option<Uuid> {
        self.inner.lock().await.pending.get(node_uuid).copied()
    }

    pub async fn ready_job_uuid(&self, node_uuid: &str) -> Option<Uuid> {
        self.inner.lock().await.ready.get(node_uuid).copied()
    }

    pub async fn state_of(&self, node_uuid: &str) -> ReservationState {
        let ledger = self.inner.lock().await;
        if ledger.pending.contains_key(node_uuid) {
            ReservationState::Pending
        } else if ledger.ready.contains_key(node_uuid) {
            ReservationState::Ready
        } else {
            ReservationState::None
        }
    }

    pub async fn nb_reserved_nodes(&self, job_uuid: &Uuid) -> usize {
        let ledger = self.inner.lock().await;
        ledger.job_pending.get(job_uuid).map_or(0, HashSet::len)
            + ledger.job_ready.get(job_uuid).map_or(0, HashSet::len)
    }

    pub async fn view(&self) -> ReservationsView {
        let ledger = self.inner.lock().await;
        ReservationsView {
            pending_jobs: ledger.job_pending.keys().copied().collect(),
            ready_jobs: ledger.job_ready.keys().copied().collect(),
            pending_nodes: ledger.pending.keys().cloned().collect(),
            ready_nodes: ledger.ready.keys().cloned().collect(),
        }
    }
}
