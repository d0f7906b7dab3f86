//! Driver-side view of one node connection.
//!
//! A [`NodeChannel`] is created when a node connects and lives until the
//! connection closes. It owns the in-flight dispatch units sent over it,
//! keyed by [`BundleKey`], and the load balancer bound to the node.
//!
//! All mutating operations go through the channel lock ([`NodeChannel::lock`]).
//! Status changes are never applied to the idle pool inline: they are
//! published as [`PoolEvent`]s and applied by the pool-membership updater.

pub mod status;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::balancer::Bundler;
use crate::error::{GridError, Result};
use crate::policy::system_info::{PROVISIONING_MASTER_UUID, NODE_UUID};
use crate::policy::SystemInfo;
use crate::scheduler::job::{BundleKey, DispatchUnit};
use crate::transport::message::{DispatchHeader, Header, Message};

pub use status::{ExecutionStatus, PoolEvent};

/// Immutable facts learned from the node's handshake.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeIdentity {
    pub node_uuid: String,
    pub peer: bool,
    pub local: bool,
    pub offline: bool,
    pub provisioning_master: bool,
    pub provisioning_slave: bool,
    pub management_host: Option<String>,
    pub management_port: Option<u16>,
    pub remote_addr: Option<SocketAddr>,
}

/// A message waiting in a channel's outbound queue.
#[derive(Debug)]
pub struct Outbound {
    pub message: Message,
    /// Set when the message carries a dispatch unit
    pub unit: Option<BundleKey>,
}

/// Mutable channel state, guarded by the channel lock.
#[derive(Debug)]
pub struct ChannelState {
    status: ExecutionStatus,
    pub system_info: SystemInfo,
    pub max_jobs: usize,
    pub accepting_new_jobs: bool,
    pub enabled: bool,
    /// Member of the idle pool
    pub idle: bool,
    /// Last configuration distance computed for a desired-configuration job
    pub reservation_score: u32,
    /// Keep reservations of this node when the connection closes
    pub keep_reservation: bool,
    entries: HashMap<BundleKey, Arc<DispatchUnit>>,
    bundler: Box<dyn Bundler>,
}

impl ChannelState {
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn current_jobs(&self) -> usize {
        self.entries.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.entries.len() < self.max_jobs
    }

    pub fn nb_bundles_for_job(&self, job_uuid: &Uuid) -> usize {
        self.entries.keys().filter(|k| k.job_uuid == *job_uuid).count()
    }

    pub fn entry(&self, key: &BundleKey) -> Option<&Arc<DispatchUnit>> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<DispatchUnit>> {
        self.entries.values()
    }

    pub fn bundler(&self) -> &dyn Bundler {
        self.bundler.as_ref()
    }

    pub fn bundler_mut(&mut self) -> &mut dyn Bundler {
        self.bundler.as_mut()
    }
}

#[derive(Debug)]
pub struct NodeChannel {
    id: String,
    me: Weak<NodeChannel>,
    identity: OnceLock<NodeIdentity>,
    state: Mutex<ChannelState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<PoolEvent>,
    closed: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl NodeChannel {
    /// Create a channel in `Connecting` state. The returned receiver is the
    /// channel's outbound queue, drained by the connection's writer task.
    pub fn new(
        bundler: Box<dyn Bundler>,
        max_jobs: usize,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let channel = Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4().to_string(),
            me: me.clone(),
            identity: OnceLock::new(),
            state: Mutex::new(ChannelState {
                status: ExecutionStatus::Connecting,
                system_info: SystemInfo::new(),
                max_jobs: max_jobs.max(1),
                accepting_new_jobs: true,
                enabled: true,
                idle: false,
                reservation_score: 0,
                keep_reservation: false,
                entries: HashMap::new(),
                bundler,
            }),
            outbound,
            events,
            closed: CancellationToken::new(),
            connected_at: Utc::now(),
        });
        (channel, rx)
    }

    /// Connection id, unique per connection instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Node uuid, or the connection id before the handshake completed.
    pub fn uuid(&self) -> &str {
        self.identity
            .get()
            .map(|i| i.node_uuid.as_str())
            .unwrap_or(&self.id)
    }

    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.get()
    }

    pub fn set_identity(&self, identity: NodeIdentity) -> Result<()> {
        self.identity
            .set(identity)
            .map_err(|_| GridError::InvalidState(format!("channel {} already identified", self.id)))
    }

    pub fn is_peer(&self) -> bool {
        self.identity.get().is_some_and(|i| i.peer)
    }

    pub fn is_local(&self) -> bool {
        self.identity.get().is_some_and(|i| i.local)
    }

    pub fn is_offline(&self) -> bool {
        self.identity.get().is_some_and(|i| i.offline)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Acquire the channel lock.
    pub async fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().await
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.state.lock().await.status
    }

    fn arc(&self) -> Option<Arc<NodeChannel>> {
        self.me.upgrade()
    }

    fn publish(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(channel = %self.id, "Pool updater gone, event dropped");
        }
    }

    /// Change the execution status under the channel lock and publish the
    /// change to the pool-membership updater.
    pub fn set_status(&self, state: &mut ChannelState, next: ExecutionStatus) -> Result<()> {
        let old = state.status;
        if old == next {
            return Ok(());
        }
        if !old.can_transition_to(next) {
            return Err(GridError::InvalidState(format!(
                "channel {} cannot go from {} to {}",
                self.id, old, next
            )));
        }
        state.status = next;
        tracing::debug!(channel = %self.id, node = %self.uuid(), %old, new = %next, "Channel status changed");
        if let Some(channel) = self.arc() {
            self.publish(PoolEvent::StatusChanged { channel, old, new: next });
        }
        Ok(())
    }

    /// Publish a membership re-evaluation (capacity or job count changed).
    pub fn refresh(&self) {
        if let Some(channel) = self.arc() {
            self.publish(PoolEvent::Refresh(channel));
        }
    }

    pub fn set_max_jobs(&self, state: &mut ChannelState, max_jobs: usize) {
        if max_jobs > 0 && max_jobs != state.max_jobs {
            tracing::debug!(channel = %self.id, old = state.max_jobs, new = max_jobs, "Node max jobs updated");
            state.max_jobs = max_jobs;
            self.refresh();
        }
    }

    /// Provisioning group this node belongs to, if any.
    pub fn master_uuid(&self, state: &ChannelState) -> Option<String> {
        let identity = self.identity.get()?;
        if identity.provisioning_master {
            Some(identity.node_uuid.clone())
        } else if identity.provisioning_slave {
            state.system_info.get(PROVISIONING_MASTER_UUID).map(str::to_string)
        } else {
            None
        }
    }

    /// Send a dispatch unit to the node.
    ///
    /// Must be called with the channel lock held. Registers the unit as
    /// in flight, records the dispatch on the job and queues the serialized
    /// message for the writer task. The channel goes to `Executing` once it
    /// reaches its job cap.
    pub async fn submit(&self, state: &mut ChannelState, unit: Arc<DispatchUnit>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(GridError::ChannelClosed(self.id.clone()));
        }
        let key = unit.key();
        let job = unit.job();
        unit.set_offline(self.is_offline());

        let header = Header::Dispatch(DispatchHeader {
            job_uuid: job.uuid(),
            bundle_id: unit.id(),
            job_name: job.name().to_string(),
            positions: unit.positions(),
            metadata: job.metadata().clone(),
            uuid_path: job.uuid_path().to_vec(),
        });
        let mut segments: Vec<Bytes> = Vec::with_capacity(unit.task_count() + 1);
        segments.push(job.data().clone());
        segments.extend(unit.tasks().iter().map(|t| t.payload.clone()));

        state.entries.insert(key, Arc::clone(&unit));
        job.lock().await.dispatches.insert(unit.id(), self.id.clone());

        if let Err(e) = self.outbound.send(Outbound {
            message: Message::with_segments(header, segments),
            unit: Some(key),
        }) {
            state.entries.remove(&key);
            job.lock().await.dispatches.remove(&unit.id());
            return Err(GridError::ChannelClosed(format!("{}: {}", self.id, e)));
        }

        if !state.has_capacity() {
            self.set_status(state, ExecutionStatus::Executing)?;
        }
        tracing::debug!(
            channel = %self.id,
            node = %self.uuid(),
            job = %job.uuid(),
            bundle = unit.id(),
            tasks = unit.task_count(),
            "Dispatch unit submitted"
        );
        Ok(())
    }

    /// Forget an in-flight unit. Returns `None` if it was already removed,
    /// which makes result processing idempotent.
    pub fn remove_entry(&self, state: &mut ChannelState, key: &BundleKey) -> Option<Arc<DispatchUnit>> {
        state.entries.remove(key)
    }

    /// Re-attach a unit taken by an offline node that reconnected.
    pub fn add_entry(&self, state: &mut ChannelState, unit: Arc<DispatchUnit>) {
        state.entries.insert(unit.key(), unit);
    }

    /// Remove and return every in-flight unit.
    pub fn take_entries(&self, state: &mut ChannelState) -> Vec<Arc<DispatchUnit>> {
        state.entries.drain().map(|(_, unit)| unit).collect()
    }

    /// Back to `Active` once below the job cap; otherwise let the pool
    /// updater re-evaluate membership.
    pub fn unit_returned(&self, state: &mut ChannelState) {
        if state.status == ExecutionStatus::Executing && state.has_capacity() {
            if let Err(e) = self.set_status(state, ExecutionStatus::Active) {
                tracing::warn!(channel = %self.id, error = %e, "Could not reactivate channel");
            }
        } else {
            self.refresh();
        }
    }

    /// Queue a control message (no dispatch unit attached).
    pub fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(GridError::ChannelClosed(self.id.clone()));
        }
        self.outbound
            .send(Outbound {
                message,
                unit: None,
            })
            .map_err(|_| GridError::ChannelClosed(self.id.clone()))
    }

    /// Ask the node to stop working on a unit. Best effort: offline nodes
    /// cannot be reached and just return false.
    pub fn cancel_job(&self, job_uuid: Uuid, bundle_id: u64) -> bool {
        if self.is_offline() {
            return false;
        }
        match self.send(Message::new(Header::Cancel { job_uuid, bundle_id })) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(channel = %self.id, job = %job_uuid, error = %e, "Node-side cancel not sent");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the connection must shut down.
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Mark the connection closed and the channel `Failed`. Returns false if
    /// it was already closed.
    pub fn close(&self, state: &mut ChannelState) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        if !state.status.is_terminal() {
            if let Err(e) = self.set_status(state, ExecutionStatus::Failed) {
                tracing::warn!(channel = %self.id, error = %e, "Could not fail channel");
            }
        }
        true
    }

    /// Load-balancer feedback after a unit came back.
    pub fn feedback(state: &mut ChannelState, nb_tasks: usize, round_trip: Duration, node_elapsed: Option<Duration>) {
        let bundler = state.bundler_mut();
        if let Some(node) = node_elapsed {
            if let Some(ext) = bundler.extended() {
                ext.feedback_ex(nb_tasks, round_trip, node);
                return;
            }
        }
        bundler.feedback(nb_tasks, round_trip);
    }

    /// Serializable snapshot for the management surface.
    pub async fn view(&self) -> ChannelView {
        let state = self.state.lock().await;
        let identity = self.identity.get().cloned().unwrap_or_default();
        ChannelView {
            id: self.id.clone(),
            uuid: self.uuid().to_string(),
            status: state.status,
            peer: identity.peer,
            local: identity.local,
            offline: identity.offline,
            management_host: identity.management_host,
            management_port: identity.management_port,
            current_jobs: state.current_jobs(),
            max_jobs: state.max_jobs,
            accepting_new_jobs: state.accepting_new_jobs,
            enabled: state.enabled,
            idle: state.idle,
            bundler: state.bundler.name(),
            system_info: state.system_info.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Build a channel's property bag from its handshake.
pub fn node_properties(identity: &NodeIdentity, info: &SystemInfo) -> SystemInfo {
    let mut props = info.clone();
    props.set(NODE_UUID, &identity.node_uuid);
    props
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub id: String,
    pub uuid: String,
    pub status: ExecutionStatus,
    pub peer: bool,
    pub local: bool,
    pub offline: bool,
    pub management_host: Option<String>,
    pub management_port: Option<u16>,
    pub current_jobs: usize,
    pub max_jobs: usize,
    pub accepting_new_jobs: bool,
    pub enabled: bool,
    pub idle: bool,
    pub bundler: &'static str,
    pub system_info: SystemInfo,
    pub connected_at: DateTime<Utc>,
}
