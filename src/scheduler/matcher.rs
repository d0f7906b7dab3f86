//! Job-to-channel placement.
//!
//! One call to [`DispatchMatcher::try_dispatch_one`] places at most one
//! dispatch unit. The idle pool lock is held for the whole call; channel
//! locks are taken one at a time underneath it.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use crate::balancer::BundlerFactory;
use crate::channel::{ChannelState, ExecutionStatus, NodeChannel};
use crate::driver::DriverContext;
use crate::error::Result;
use crate::handler::failure::handle_channel_failure;
use crate::policy::system_info::PEER_TOTAL_NODES;
use crate::policy::{configuration_distance, PolicyContext, SystemInfo};
use crate::scheduler::job::Job;

/// Job facts sampled once per matcher pass.
struct JobView {
    channels: usize,
    groups: HashSet<String>,
}

struct Candidate {
    channel: Arc<NodeChannel>,
    info: SystemInfo,
}

#[derive(Debug, Clone)]
pub struct DispatchMatcher {
    ctx: Arc<DriverContext>,
}

impl DispatchMatcher {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    /// Place one dispatch unit on one idle channel. Returns whether anything
    /// was dispatched.
    pub async fn try_dispatch_one(&self) -> Result<bool> {
        let ctx = &self.ctx;
        let nodes = ctx.node_uuids().await;
        ctx.queue.process_pending_broadcasts(&nodes).await;
        if ctx.queue.is_empty().await {
            return Ok(false);
        }

        let mut idle = ctx.idle_pool.lock().await;
        if idle.is_empty() {
            return Ok(false);
        }
        let jobs = ctx.queue.all_jobs_snapshot().await;
        let driver_info = ctx.driver_info().await;
        tracing::trace!(jobs = jobs.len(), idle = idle.len(), "Matching jobs against idle channels");

        for job in jobs {
            if idle.is_empty() {
                break;
            }
            let sla = job.sla();
            let job_uuid = job.uuid();
            let desired = sla.desired_configuration.is_some();
            if desired
                && ctx.reservations.nb_reserved_nodes(&job_uuid).await >= sla.max_nodes
                && !ctx.reservations.has_ready_node(&job_uuid).await
            {
                tracing::trace!(job = %job_uuid, "Reservation cap reached, no ready node");
                continue;
            }

            let Some(view) = self.job_view(&job).await else {
                continue;
            };
            if let Some(policy) = &sla.grid_policy {
                let pctx = policy_context(&job, view.channels, &driver_info);
                if !policy.evaluate(&driver_info, &pctx) {
                    tracing::trace!(job = %job_uuid, "Grid policy rejected job");
                    continue;
                }
            }

            let Some(channel) = self.find_channel(&mut idle, &job, &view, &driver_info).await else {
                continue;
            };

            let mut state = channel.lock().await;
            if desired {
                let node = channel.uuid();
                let ready = ctx.reservations.ready_job_uuid(node).await;
                let pending = ctx.reservations.pending_job_uuid(node).await;
                if ready.is_none() && pending.is_none() {
                    // an in-place reservation is usable right away, so run another pass
                    if ctx.reservations.do_reservation(&job, &channel, &mut state).await {
                        ctx.queue.notify_bundle_added();
                    }
                    continue;
                }
            }
            if !state.has_capacity() {
                ctx.idle_pool.remove_locked(&mut idle, &channel, &mut state);
                continue;
            }
            if !state.enabled || channel.is_closed() || state.status() != ExecutionStatus::Active {
                continue;
            }

            let size = match state.bundler().bundle_size() {
                Ok(size) => size,
                Err(e) => {
                    tracing::warn!(channel = %channel.id(), error = %e, "Load balancer failed, using fallback");
                    BundlerFactory::fallback().bundle_size().unwrap_or(1)
                }
            };
            let size = size.min(sla.max_dispatch_size).max(1);
            let Some(unit) = ctx.queue.next_dispatch_unit(&job, size).await else {
                continue;
            };
            let tasks = unit.task_count();
            if let Err(e) = channel.submit(&mut state, Arc::clone(&unit)).await {
                tracing::error!(channel = %channel.id(), job = %job_uuid, error = %e, "Dispatch failed");
                drop(state);
                ctx.queue.resubmit(&job, &unit.positions()).await;
                let ctx = Arc::clone(ctx);
                tokio::spawn(async move {
                    handle_channel_failure(&ctx, &channel, "dispatch failed").await;
                });
                continue;
            }
            ctx.stats.tasks_dispatched(tasks);
            if !state.has_capacity() {
                ctx.idle_pool.remove_locked(&mut idle, &channel, &mut state);
            }
            tracing::debug!(
                job = %job_uuid,
                node = %channel.uuid(),
                bundle = unit.id(),
                tasks,
                "Dispatched unit"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Sample the job's dispatch state, or `None` if it cannot take a new
    /// channel right now.
    async fn job_view(&self, job: &Job) -> Option<JobView> {
        let channel_ids = {
            let state = job.lock().await;
            if state.cancelled
                || state.suspended
                || state.pending
                || state.expired
                || !state.has_queued_tasks()
                || state.nb_channels() >= job.sla().max_nodes
            {
                return None;
            }
            state.channel_ids()
        };
        let mut groups = HashSet::new();
        if limits_groups(job.sla().max_node_provisioning_groups) {
            for id in &channel_ids {
                if let Some(channel) = self.ctx.channel_by_id(id).await {
                    let state = channel.lock().await;
                    if let Some(master) = channel.master_uuid(&state) {
                        groups.insert(master);
                    }
                }
            }
        }
        Some(JobView {
            channels: channel_ids.len(),
            groups,
        })
    }

    /// Pick a channel from the idle pool for `job`, or `None`.
    ///
    /// Stale members found on the way (no longer active, closed or disabled)
    /// are dropped from the pool.
    async fn find_channel(
        &self,
        idle: &mut Vec<Arc<NodeChannel>>,
        job: &Arc<Job>,
        view: &JobView,
        driver_info: &SystemInfo,
    ) -> Option<Arc<NodeChannel>> {
        let ctx = &self.ctx;
        let sla = job.sla();
        let config = &ctx.config.scheduler;
        let job_uuid = job.uuid();
        let pctx = policy_context(job, view.channels, driver_info);
        let desired = sla.desired_configuration.as_ref();
        let (ready_nodes, nb_reserved) = if desired.is_some() {
            (
                ctx.reservations.ready_nodes(&job_uuid).await,
                ctx.reservations.nb_reserved_nodes(&job_uuid).await,
            )
        } else {
            (None, 0)
        };

        let mut acceptable: Vec<Candidate> = Vec::new();
        let mut stale: Vec<Arc<NodeChannel>> = Vec::new();
        let members: Vec<Arc<NodeChannel>> = idle.clone();
        for channel in members {
            let state = channel.lock().await;
            if state.status() != ExecutionStatus::Active || channel.is_closed() || !state.enabled {
                drop(state);
                stale.push(channel);
                continue;
            }
            if !state.accepting_new_jobs || !state.has_capacity() {
                continue;
            }
            if channel.is_peer() && ctx.stats.real_nodes() >= config.peer_load_balance_threshold {
                continue;
            }
            if job.uuid_path().iter().any(|u| u == channel.uuid()) {
                continue;
            }
            if channel.is_peer() && job.uuid_path().len().saturating_sub(1) >= sla.max_driver_depth {
                continue;
            }
            if !sla.allow_multiple_dispatches_to_same_channel && state.nb_bundles_for_job(&job_uuid) > 0 {
                continue;
            }
            if job.broadcast_uuid().is_some_and(|b| b != channel.uuid()) {
                continue;
            }
            if channel.is_peer()
                && !config.dispatch_to_peers_without_nodes
                && state.system_info.get_i64(PEER_TOTAL_NODES).unwrap_or(0) <= 0
            {
                continue;
            }
            if let Some(policy) = &sla.execution_policy {
                if !policy.evaluate(&state.system_info, &pctx) {
                    continue;
                }
            }
            if !within_group_limit(&channel, &state, view, sla.max_node_provisioning_groups) {
                continue;
            }
            if desired.is_some() {
                if ctx.reservations.pending_job_uuid(channel.uuid()).await.is_some() {
                    continue;
                }
                let is_ready = ready_nodes.as_ref().is_some_and(|r| r.contains(channel.uuid()));
                if !is_ready && nb_reserved >= sla.max_nodes {
                    continue;
                }
            }
            if channel.is_local() && config.local_node_bias {
                if desired.is_some() {
                    continue;
                }
                drop(state);
                self.drop_stale(idle, &stale).await;
                tracing::trace!(job = %job_uuid, channel = %channel.id(), "Local node preferred");
                return Some(channel);
            }
            let info = state.system_info.clone();
            drop(state);
            acceptable.push(Candidate { channel, info });
        }
        self.drop_stale(idle, &stale).await;

        // Preferences only narrow the candidates that passed the hard filters.
        // A preference no candidate satisfies yields to the next one, and when
        // none match the job still dispatches to any acceptable candidate.
        if let Some(preferences) = &sla.preference_policy {
            for preference in preferences {
                let preferred: Vec<usize> = acceptable
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| preference.evaluate(&c.info, &pctx))
                    .map(|(i, _)| i)
                    .collect();
                if !preferred.is_empty() {
                    let mut index = 0;
                    acceptable.retain(|_| {
                        let keep = preferred.contains(&index);
                        index += 1;
                        keep
                    });
                    break;
                }
            }
        }

        if let Some(desired) = desired {
            acceptable = self.lowest_distances(acceptable, job, &desired.properties).await;
        }
        tracing::trace!(job = %job_uuid, candidates = acceptable.len(), "Acceptable channels");
        if acceptable.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..acceptable.len());
        Some(acceptable.swap_remove(index).channel)
    }

    /// Keep the candidates closest to the desired configuration. Local,
    /// offline and peer channels cannot be reconfigured and are excluded.
    async fn lowest_distances(
        &self,
        candidates: Vec<Candidate>,
        job: &Job,
        desired: &SystemInfo,
    ) -> Vec<Candidate> {
        let mut best: Vec<Candidate> = Vec::new();
        let mut min = u32::MAX;
        for candidate in candidates {
            let channel = &candidate.channel;
            if channel.is_local() || channel.is_offline() || channel.is_peer() {
                continue;
            }
            if self.ctx.reservations.pending_job_uuid(channel.uuid()).await == Some(job.uuid()) {
                continue;
            }
            let score = configuration_distance(desired, &candidate.info);
            channel.lock().await.reservation_score = score;
            if score < min {
                min = score;
                best.clear();
                best.push(candidate);
            } else if score == min {
                best.push(candidate);
            }
        }
        best
    }

    async fn drop_stale(&self, idle: &mut Vec<Arc<NodeChannel>>, stale: &[Arc<NodeChannel>]) {
        for channel in stale {
            let mut state = channel.lock().await;
            self.ctx.idle_pool.remove_locked(idle, channel, &mut state);
        }
    }
}

fn policy_context<'a>(job: &'a Job, channels: usize, driver: &'a SystemInfo) -> PolicyContext<'a> {
    PolicyContext {
        job_name: job.name(),
        priority: job.sla().priority,
        max_nodes: job.sla().max_nodes,
        job_channels: channels,
        metadata: job.metadata(),
        driver,
    }
}

/// Zero and `usize::MAX` both mean no provisioning group limit.
fn limits_groups(max_groups: usize) -> bool {
    max_groups != 0 && max_groups != usize::MAX
}

/// A job may span at most `max_groups` provisioning groups. Nodes outside
/// any group are never limited.
fn within_group_limit(channel: &NodeChannel, state: &ChannelState, view: &JobView, max_groups: usize) -> bool {
    if !limits_groups(max_groups) {
        return true;
    }
    match channel.master_uuid(state) {
        Some(master) => view.groups.contains(&master) || view.groups.len() < max_groups,
        None => true,
    }
}
