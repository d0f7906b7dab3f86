//! Driver wiring.
//!
//! [`DriverContext`] is the explicit dependency container shared by the
//! dispatch loop, the matcher, the node server and the handlers. [`Driver`]
//! owns one and runs the long-lived tasks around it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::balancer::BundlerFactory;
use crate::channel::{ExecutionStatus, NodeChannel, Outbound, PoolEvent};
use crate::config::DriverConfig;
use crate::dashboard::{self, DashboardState};
use crate::error::{GridError, Result};
use crate::handler::expiration::ScheduleHandler;
use crate::handler::failure::handle_channel_failure;
use crate::handler::offline::OfflineHolder;
use crate::policy::SystemInfo;
use crate::scheduler::dispatch_loop::run_dispatch_loop;
use crate::scheduler::idle_pool::IdlePool;
use crate::scheduler::job::{Job, JobSpec};
use crate::scheduler::queue::JobQueue;
use crate::scheduler::reservation::ReservationLedger;
use crate::stats::DriverStats;
use crate::transport::server;

pub const DRIVER_UUID: &str = "driver.uuid";
pub const DRIVER_NB_NODES: &str = "driver.nb.nodes";
pub const DRIVER_NB_PEERS: &str = "driver.nb.peers";
pub const DRIVER_NB_IDLE_NODES: &str = "driver.nb.idle.nodes";
pub const DRIVER_NB_JOBS: &str = "driver.nb.jobs";

/// Everything the scheduling and connection code shares.
#[derive(Debug)]
pub struct DriverContext {
    pub config: DriverConfig,
    pub queue: Arc<JobQueue>,
    pub idle_pool: IdlePool,
    pub reservations: Arc<ReservationLedger>,
    pub stats: Arc<DriverStats>,
    pub bundlers: BundlerFactory,
    pub expirations: Arc<ScheduleHandler>,
    pub offline: OfflineHolder,
    /// Wakes the dispatch loop
    pub wake: Arc<Notify>,
    system_info: SystemInfo,
    connections: RwLock<HashMap<String, Arc<NodeChannel>>>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl DriverContext {
    /// Build a context. The returned receiver feeds the pool-membership
    /// updater, see [`spawn_pool_updater`].
    pub fn new(config: DriverConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let reservations = Arc::new(ReservationLedger::new());
        let stats = Arc::new(DriverStats::new());
        let mut system_info = SystemInfo::local_host();
        system_info.set(DRIVER_UUID, &config.uuid);

        let ctx = Arc::new(Self {
            queue: Arc::new(
                JobQueue::with_capacity(config.queue_capacity, Arc::clone(&wake))
                    .with_finished_retention(config.finished_job_retention),
            ),
            idle_pool: IdlePool::new(Arc::clone(&reservations), Arc::clone(&stats), Arc::clone(&wake)),
            reservations,
            stats,
            bundlers: BundlerFactory::new(config.balancer.clone()),
            expirations: Arc::new(ScheduleHandler::new("dispatch-expiration")),
            offline: OfflineHolder::new(),
            wake,
            system_info,
            connections: RwLock::new(HashMap::new()),
            events,
            config,
        });
        (ctx, events_rx)
    }

    /// Create a channel for a freshly accepted connection and register it.
    pub async fn open_channel(&self) -> (Arc<NodeChannel>, mpsc::UnboundedReceiver<Outbound>) {
        let (channel, outbound) = NodeChannel::new(
            self.bundlers.create(),
            self.config.default_node_max_jobs,
            self.events.clone(),
        );
        self.connections
            .write()
            .await
            .insert(channel.id().to_string(), Arc::clone(&channel));
        (channel, outbound)
    }

    /// Drop a channel from the connection registry. Returns false if it was
    /// not registered.
    pub async fn unregister(&self, channel: &NodeChannel) -> bool {
        self.connections.write().await.remove(channel.id()).is_some()
    }

    pub async fn connections(&self) -> Vec<Arc<NodeChannel>> {
        let mut channels: Vec<Arc<NodeChannel>> = self.connections.read().await.values().cloned().collect();
        channels.sort_by_key(|c| c.connected_at());
        channels
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn channel_by_id(&self, id: &str) -> Option<Arc<NodeChannel>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Live connection of a node, looked up by node uuid.
    pub async fn channel_by_node(&self, node_uuid: &str) -> Option<Arc<NodeChannel>> {
        self.connections
            .read()
            .await
            .values()
            .find(|c| c.identity().is_some() && c.uuid() == node_uuid && !c.is_closed())
            .cloned()
    }

    /// Uuids of identified real nodes, targets of broadcast expansion.
    pub async fn node_uuids(&self) -> Vec<String> {
        let mut uuids: Vec<String> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.identity().is_some() && !c.is_peer() && !c.is_closed())
            .map(|c| c.uuid().to_string())
            .collect();
        uuids.sort();
        uuids.dedup();
        uuids
    }

    /// The driver's own properties plus live counters, evaluated by grid
    /// policies.
    pub async fn driver_info(&self) -> SystemInfo {
        let snapshot = self.stats.snapshot();
        let mut info = self.system_info.clone();
        info.set(DRIVER_NB_NODES, snapshot.nodes);
        info.set(DRIVER_NB_PEERS, snapshot.peers);
        info.set(DRIVER_NB_IDLE_NODES, snapshot.idle_nodes);
        info.set(DRIVER_NB_JOBS, self.queue.len().await);
        info
    }

    /// Queue a job for dispatch. The driver's uuid is appended to the job's
    /// driver path.
    pub async fn submit_job(&self, mut spec: JobSpec) -> Result<Arc<Job>> {
        if spec.tasks.is_empty() {
            return Err(GridError::InvalidArgument("job has no tasks".to_string()));
        }
        if spec.uuid_path.iter().any(|u| *u == self.config.uuid) {
            return Err(GridError::InvalidArgument(format!(
                "job already went through driver {}",
                self.config.uuid
            )));
        }
        spec.uuid_path.push(self.config.uuid.clone());
        let job = Arc::new(Job::new(spec));
        self.queue.add_job(Arc::clone(&job)).await?;
        self.stats.job_submitted();
        Ok(job)
    }

    /// Cancel a job and ask the nodes holding its units to stop.
    ///
    /// Returns false if it was already cancelled.
    pub async fn cancel_job(&self, uuid: Uuid) -> Result<bool> {
        let job = self.queue.get(&uuid).await.ok_or(GridError::JobNotFound(uuid))?;
        let mut targets = vec![Arc::clone(&job)];
        if job.sla().broadcast {
            targets.extend(
                self.queue
                    .jobs()
                    .await
                    .into_iter()
                    .filter(|j| j.broadcast_parent() == Some(uuid)),
            );
        }
        if !self.queue.cancel_job(uuid).await? {
            return Ok(false);
        }
        for target in &targets {
            self.reservations.remove_job_reservations(&target.uuid()).await;
            let dispatches = target.lock().await.dispatches.clone();
            for (bundle_id, channel_id) in dispatches {
                if let Some(channel) = self.channel_by_id(&channel_id).await {
                    channel.cancel_job(target.uuid(), bundle_id);
                }
            }
        }
        Ok(true)
    }

    /// Bookkeeping once every task of a job is terminal.
    pub async fn job_finished(&self, job: &Job) {
        self.queue.retire(&job.uuid()).await;
        self.reservations.remove_job_reservations(&job.uuid()).await;
        self.stats.job_completed();
    }

    /// Enable or disable dispatching to a connected node.
    pub async fn set_node_enabled(&self, node_uuid: &str, enabled: bool) -> Result<()> {
        let channel = self
            .channel_by_node(node_uuid)
            .await
            .ok_or_else(|| GridError::ChannelNotFound(node_uuid.to_string()))?;
        let mut state = channel.lock().await;
        if state.enabled != enabled {
            state.enabled = enabled;
            tracing::info!(node = %node_uuid, enabled, "Node dispatch toggled");
            channel.refresh();
        }
        Ok(())
    }

    /// Close a node's connection; its in-flight units are resubmitted.
    pub async fn close_node(&self, node_uuid: &str) -> Result<()> {
        let channel = self
            .channel_by_node(node_uuid)
            .await
            .ok_or_else(|| GridError::ChannelNotFound(node_uuid.to_string()))?;
        handle_channel_failure(self, &channel, "closed by operator").await;
        Ok(())
    }
}

/// Apply pool events until every sender is gone.
///
/// This is the single task that adds channels to the idle pool, so adds are
/// serialized and never run from inside a channel callback.
pub fn spawn_pool_updater(
    ctx: Arc<DriverContext>,
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PoolEvent::StatusChanged { channel, old, new } => {
                    tracing::trace!(channel = %channel.id(), %old, %new, "Applying status change");
                    if new.is_terminal() {
                        ctx.idle_pool.remove(&channel).await;
                        if channel.identity().is_some() && ctx.channel_by_node(channel.uuid()).await.is_none() {
                            ctx.queue.cancel_broadcast_jobs(channel.uuid()).await;
                        }
                    } else {
                        refresh_membership(&ctx, &channel).await;
                    }
                }
                PoolEvent::Refresh(channel) => refresh_membership(&ctx, &channel).await,
            }
        }
        tracing::debug!("Pool updater stopped");
    })
}

async fn refresh_membership(ctx: &DriverContext, channel: &Arc<NodeChannel>) {
    let eligible = {
        let state = channel.lock().await;
        state.status() == ExecutionStatus::Active && state.has_capacity() && !channel.is_closed()
    };
    if !eligible {
        ctx.idle_pool.remove(channel).await;
        return;
    }
    // status may have moved on since the check; add re-validates
    if let Err(e) = ctx.idle_pool.add(channel).await {
        tracing::debug!(channel = %channel.id(), error = %e, "Channel not added to idle pool");
    }
}

/// A running driver: node server, dispatch loop, pool updater and the
/// optional management dashboard.
pub struct Driver {
    ctx: Arc<DriverContext>,
    events: mpsc::UnboundedReceiver<PoolEvent>,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        let (ctx, events) = DriverContext::new(config);
        Self { ctx, events }
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    /// Bind the configured node address and run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.ctx.config.node_listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run on an already bound listener (tests bind port 0).
    pub async fn run_with_listener(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let Driver { ctx, events } = self;
        tracing::info!(
            uuid = %ctx.config.uuid,
            addr = %listener.local_addr()?,
            balancer = %ctx.config.balancer.algorithm,
            "Driver starting"
        );

        let updater = spawn_pool_updater(Arc::clone(&ctx), events);
        let dispatcher = tokio::spawn(run_dispatch_loop(Arc::clone(&ctx), shutdown.clone()));
        let dashboard = ctx.config.dashboard_addr.map(|addr| {
            tokio::spawn(dashboard::run_dashboard(addr, DashboardState::new(Arc::clone(&ctx))))
        });

        let served = server::serve(listener, Arc::clone(&ctx), shutdown.clone()).await;

        for channel in ctx.connections().await {
            handle_channel_failure(&ctx, &channel, "driver shutting down").await;
        }
        ctx.expirations.cancel_all().await;
        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "Dispatch loop task failed");
        }
        if let Some(dashboard) = dashboard {
            dashboard.abort();
        }
        updater.abort();
        tracing::info!("Driver stopped");
        served.map_err(GridError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::sla::JobSla;

    fn context() -> Arc<DriverContext> {
        let mut config = DriverConfig::default();
        config.uuid = "driver-1".to_string();
        DriverContext::new(config).0
    }

    #[tokio::test]
    async fn submit_appends_driver_to_path() {
        let ctx = context();
        let job = ctx.submit_job(JobSpec::new("j", ["true"])).await.unwrap();
        assert_eq!(job.uuid_path(), ["driver-1".to_string()]);
        assert_eq!(ctx.stats.snapshot().jobs_submitted, 1);
        assert_eq!(ctx.queue.len().await, 1);
    }

    #[tokio::test]
    async fn submit_rejects_loops_and_empty_jobs() {
        let ctx = context();
        let mut looped = JobSpec::new("j", ["true"]);
        looped.uuid_path.push("driver-1".to_string());
        assert!(matches!(ctx.submit_job(looped).await, Err(GridError::InvalidArgument(_))));
        let empty = JobSpec::new("j", Vec::<String>::new());
        assert!(matches!(ctx.submit_job(empty).await, Err(GridError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn cancel_unknown_job_fails() {
        let ctx = context();
        assert!(matches!(
            ctx.cancel_job(Uuid::new_v4()).await,
            Err(GridError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_is_reported_once() {
        let ctx = context();
        let job = ctx
            .submit_job(JobSpec::new("j", ["true", "true"]).with_sla(JobSla::default()))
            .await
            .unwrap();
        assert!(ctx.cancel_job(job.uuid()).await.unwrap());
        assert!(!ctx.cancel_job(job.uuid()).await.unwrap());
        assert!(job.is_done());
    }

    #[tokio::test]
    async fn driver_info_carries_live_counters() {
        let ctx = context();
        ctx.stats.node_connected(false);
        ctx.submit_job(JobSpec::new("j", ["true"])).await.unwrap();
        let info = ctx.driver_info().await;
        assert_eq!(info.get(DRIVER_UUID), Some("driver-1"));
        assert_eq!(info.get_i64(DRIVER_NB_NODES), Some(1));
        assert_eq!(info.get_i64(DRIVER_NB_JOBS), Some(1));
    }
}
