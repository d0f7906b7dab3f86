use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::scheduler::job::{DispatchUnit, Job, ServerTask, TaskState};

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_FINISHED_RETENTION: usize = 1_000;

#[derive(Debug)]
struct QueuedJob {
    job: Arc<Job>,
    /// FIFO rank inside a priority level; bumped each time a unit is taken
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, QueuedJob>,
    /// Broadcast parents, waiting for expansion or for their children
    broadcasts: HashMap<Uuid, Arc<Job>>,
    pending_broadcasts: VecDeque<Uuid>,
    finished: HashMap<Uuid, Arc<Job>>,
    /// Retirement order of `finished`, oldest first
    finished_order: VecDeque<Uuid>,
}

/// Priority job queue consumed by the dispatch matcher.
///
/// Jobs are ordered by SLA priority (highest first), then by FIFO rank. A job
/// that just handed out a dispatch unit moves to the back of its priority
/// level so that equal-priority jobs share the grid.
#[derive(Debug)]
pub struct JobQueue {
    state: RwLock<QueueState>,
    capacity: usize,
    finished_retention: usize,
    next_seq: AtomicU64,
    bundle_added: Arc<Notify>,
}

impl JobQueue {
    pub fn new(bundle_added: Arc<Notify>) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, bundle_added)
    }

    pub fn with_capacity(capacity: usize, bundle_added: Arc<Notify>) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            capacity,
            finished_retention: DEFAULT_FINISHED_RETENTION,
            next_seq: AtomicU64::new(0),
            bundle_added,
        }
    }

    /// Keep at most `retention` finished jobs queryable; older ones are
    /// dropped as new jobs finish.
    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Wake whoever waits for new dispatchable work.
    pub fn notify_bundle_added(&self) {
        self.bundle_added.notify_one();
    }

    /// Add a job. Broadcast jobs wait for [`process_pending_broadcasts`].
    ///
    /// Start-delay and expiration schedules declared by the SLA are armed here.
    ///
    /// [`process_pending_broadcasts`]: JobQueue::process_pending_broadcasts
    pub async fn add_job(self: &Arc<Self>, job: Arc<Job>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.jobs.len() + state.broadcasts.len() >= self.capacity {
                tracing::warn!(job = %job.uuid(), "Job queue at capacity, job rejected");
                return Err(GridError::QueueFull);
            }
            if job.sla().broadcast {
                state.pending_broadcasts.push_back(job.uuid());
                state.broadcasts.insert(job.uuid(), Arc::clone(&job));
            } else {
                let seq = self.seq();
                state.jobs.insert(
                    job.uuid(),
                    QueuedJob {
                        job: Arc::clone(&job),
                        seq,
                    },
                );
            }
        }
        tracing::info!(
            job = %job.uuid(),
            name = %job.name(),
            priority = job.sla().priority,
            broadcast = job.sla().broadcast,
            "Job queued"
        );

        if let Some(delay) = job.sla().start_delay_ms {
            let job = Arc::clone(&job);
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                job.lock().await.pending = false;
                tracing::debug!(job = %job.uuid(), "Start delay elapsed");
                queue.notify_bundle_added();
            });
        }
        if let Some(expiration) = job.sla().expiration_ms {
            let job = Arc::clone(&job);
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(expiration)).await;
                if job.is_done() {
                    return;
                }
                job.lock().await.expired = true;
                tracing::info!(job = %job.uuid(), "Job expired");
                if let Err(e) = queue.cancel_job(job.uuid()).await {
                    tracing::warn!(job = %job.uuid(), error = %e, "Failed to cancel expired job");
                }
            });
        }

        self.notify_bundle_added();
        Ok(())
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.jobs.is_empty()
    }

    /// Number of dispatchable jobs.
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn has_pending_broadcasts(&self) -> bool {
        !self.state.read().await.pending_broadcasts.is_empty()
    }

    /// Dispatchable jobs, highest priority first, FIFO within a priority.
    pub async fn all_jobs_snapshot(&self) -> Vec<Arc<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<&QueuedJob> = state.jobs.values().collect();
        jobs.sort_by(|a, b| {
            b.job
                .sla()
                .priority
                .cmp(&a.job.sla().priority)
                .then(a.seq.cmp(&b.seq))
        });
        jobs.into_iter().map(|q| Arc::clone(&q.job)).collect()
    }

    /// Take the next unit of at most `size` tasks from `job`.
    pub async fn next_dispatch_unit(
        &self,
        job: &Arc<Job>,
        size: usize,
    ) -> Option<Arc<DispatchUnit>> {
        let unit = {
            let mut js = job.lock().await;
            job.create_dispatch_unit(&mut js, size)?
        };
        let mut state = self.state.write().await;
        let seq = self.seq();
        if let Some(queued) = state.jobs.get_mut(&job.uuid()) {
            queued.seq = seq;
        }
        Some(Arc::new(unit))
    }

    /// Look up a job in any state.
    pub async fn get(&self, uuid: &Uuid) -> Option<Arc<Job>> {
        let state = self.state.read().await;
        state
            .jobs
            .get(uuid)
            .map(|q| Arc::clone(&q.job))
            .or_else(|| state.broadcasts.get(uuid).cloned())
            .or_else(|| state.finished.get(uuid).cloned())
    }

    /// Every known job, active ones first, each group by creation time.
    pub async fn jobs(&self) -> Vec<Arc<Job>> {
        let state = self.state.read().await;
        let mut active: Vec<Arc<Job>> = state
            .jobs
            .values()
            .map(|q| Arc::clone(&q.job))
            .chain(state.broadcasts.values().cloned())
            .collect();
        active.sort_by_key(|j| j.created_at());
        let mut finished: Vec<Arc<Job>> = state.finished.values().cloned().collect();
        finished.sort_by_key(|j| j.created_at());
        active.extend(finished);
        active
    }

    /// Active broadcast children pinned to `node_uuid`.
    pub async fn broadcast_jobs_for(&self, node_uuid: &str) -> Vec<Arc<Job>> {
        self.state
            .read()
            .await
            .jobs
            .values()
            .filter(|q| q.job.broadcast_uuid() == Some(node_uuid))
            .map(|q| Arc::clone(&q.job))
            .collect()
    }

    /// Move a completed job out of the dispatchable set.
    pub async fn retire(&self, uuid: &Uuid) {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .remove(uuid)
            .map(|q| q.job)
            .or_else(|| state.broadcasts.remove(uuid));
        if let Some(job) = job {
            state.finished.insert(*uuid, job);
            state.finished_order.push_back(*uuid);
            let evicted = Self::cleanup_finished_jobs(&mut *state, self.finished_retention);
            if evicted > 0 {
                tracing::trace!(evicted, "Evicted oldest finished jobs");
            }
        }
    }

    /// Drop the oldest finished jobs beyond `retention`. Returns the number
    /// of jobs removed.
    fn cleanup_finished_jobs(state: &mut QueueState, retention: usize) -> usize {
        let mut removed = 0;
        while state.finished_order.len() > retention {
            if let Some(oldest) = state.finished_order.pop_front() {
                state.finished.remove(&oldest);
                removed += 1;
            }
        }
        removed
    }

    /// Number of finished jobs still queryable.
    pub async fn finished_len(&self) -> usize {
        self.state.read().await.finished.len()
    }

    /// Put tasks of `job` back in line and wake the dispatch loop.
    pub async fn resubmit(&self, job: &Arc<Job>, positions: &[usize]) -> usize {
        let count = job.lock().await.requeue(positions);
        if count > 0 {
            tracing::debug!(job = %job.uuid(), count, "Tasks requeued");
            self.notify_bundle_added();
        }
        count
    }

    /// Cancel a job: queued tasks are cancelled now, in-flight units are
    /// discarded when they come back. Cancelling a broadcast parent cancels
    /// its children.
    ///
    /// Returns false if the job was already cancelled.
    pub async fn cancel_job(&self, uuid: Uuid) -> Result<bool> {
        let job = self.get(&uuid).await.ok_or(GridError::JobNotFound(uuid))?;

        if job.sla().broadcast {
            let children: Vec<Arc<Job>> = {
                let mut state = self.state.write().await;
                state.pending_broadcasts.retain(|u| *u != uuid);
                state
                    .jobs
                    .values()
                    .filter(|q| q.job.broadcast_parent() == Some(uuid))
                    .map(|q| Arc::clone(&q.job))
                    .collect()
            };
            for child in &children {
                self.cancel_one(child).await;
            }
        }
        Ok(self.cancel_one(&job).await)
    }

    async fn cancel_one(&self, job: &Arc<Job>) -> bool {
        let completed = {
            let mut state = job.lock().await;
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            let cancelled = state.cancel_queued();
            tracing::info!(
                job = %job.uuid(),
                cancelled_tasks = cancelled,
                in_flight = state.dispatches.len(),
                "Job cancelled"
            );
            job.check_completion(&mut state)
        };
        if completed {
            self.retire(&job.uuid()).await;
        }
        true
    }

    /// Cancel every broadcast child pinned to a node that went away.
    pub async fn cancel_broadcast_jobs(&self, node_uuid: &str) -> Vec<Uuid> {
        let mut cancelled = Vec::new();
        for job in self.broadcast_jobs_for(node_uuid).await {
            if let Ok(true) = self.cancel_job(job.uuid()).await {
                cancelled.push(job.uuid());
            }
        }
        if !cancelled.is_empty() {
            tracing::info!(node = %node_uuid, count = cancelled.len(), "Cancelled broadcast jobs of failed node");
        }
        cancelled
    }

    /// Expand pending broadcast jobs into one child per node in `node_uuids`.
    ///
    /// Broadcasts stay pending while no node is connected. The parent completes
    /// once every child has completed.
    pub async fn process_pending_broadcasts(self: &Arc<Self>, node_uuids: &[String]) {
        if node_uuids.is_empty() {
            return;
        }
        let parents: Vec<Arc<Job>> = {
            let mut state = self.state.write().await;
            let pending: Vec<Uuid> = state.pending_broadcasts.drain(..).collect();
            pending
                .iter()
                .filter_map(|u| state.broadcasts.get(u).cloned())
                .collect()
        };

        for parent in parents {
            let template: Vec<ServerTask> = {
                let state = parent.lock().await;
                if state.cancelled {
                    continue;
                }
                state
                    .tasks
                    .iter()
                    .map(|t| ServerTask {
                        state: TaskState::Queued,
                        resubmit_count: 0,
                        expiration_count: 0,
                        result: None,
                        returned_from_node: false,
                        ..t.clone()
                    })
                    .collect()
            };

            let mut children = Vec::with_capacity(node_uuids.len());
            {
                let mut state = self.state.write().await;
                for node in node_uuids {
                    let child = Arc::new(Job::broadcast_child(&parent, template.clone(), node));
                    let seq = self.seq();
                    state.jobs.insert(
                        child.uuid(),
                        QueuedJob {
                            job: Arc::clone(&child),
                            seq,
                        },
                    );
                    children.push(child);
                }
            }
            tracing::info!(job = %parent.uuid(), nodes = children.len(), "Broadcast job expanded");

            let queue = Arc::clone(self);
            tokio::spawn(async move {
                for child in &children {
                    child.wait_done().await;
                }
                let completed = {
                    let mut state = parent.lock().await;
                    let positions: Vec<usize> = state.queued.drain(..).collect();
                    for pos in positions {
                        if let Some(task) = state.task_mut(pos) {
                            task.state = TaskState::Returned;
                        }
                    }
                    parent.check_completion(&mut state)
                };
                if completed {
                    queue.retire(&parent.uuid()).await;
                }
            });
        }
        self.notify_bundle_added();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobSpec;
    use crate::scheduler::sla::JobSla;

    fn queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::new(Arc::new(Notify::new())))
    }

    fn job(name: &str, priority: i32, tasks: usize) -> Arc<Job> {
        let commands: Vec<String> = (0..tasks).map(|i| format!("echo {}", i)).collect();
        Arc::new(Job::new(
            JobSpec::new(name, commands).with_sla(JobSla::default().with_priority(priority)),
        ))
    }

    #[tokio::test]
    async fn snapshot_orders_by_priority_then_fifo() {
        let q = queue();
        let low = job("low", 0, 1);
        let high = job("high", 5, 1);
        let low2 = job("low2", 0, 1);
        q.add_job(low.clone()).await.unwrap();
        q.add_job(high.clone()).await.unwrap();
        q.add_job(low2.clone()).await.unwrap();

        let names: Vec<String> = q
            .all_jobs_snapshot()
            .await
            .iter()
            .map(|j| j.name().to_string())
            .collect();
        assert_eq!(names, vec!["high", "low", "low2"]);
    }

    #[tokio::test]
    async fn taking_a_unit_moves_job_to_back_of_its_level() {
        let q = queue();
        let a = job("a", 0, 4);
        let b = job("b", 0, 4);
        q.add_job(a.clone()).await.unwrap();
        q.add_job(b.clone()).await.unwrap();

        let unit = q.next_dispatch_unit(&a, 2).await.unwrap();
        assert_eq!(unit.task_count(), 2);
        let snapshot = q.all_jobs_snapshot().await;
        assert_eq!(snapshot[0].name(), "b");
        assert_eq!(snapshot[1].name(), "a");
    }

    #[tokio::test]
    async fn finished_jobs_are_evicted_oldest_first() {
        let q = Arc::new(JobQueue::with_capacity(2, Arc::new(Notify::new())).with_finished_retention(3));
        let mut retired = Vec::new();
        for i in 0..500 {
            let j = job(&format!("j{}", i), 0, 1);
            q.add_job(Arc::clone(&j)).await.unwrap();
            q.retire(&j.uuid()).await;
            retired.push(j.uuid());
        }

        assert!(q.is_empty().await);
        assert_eq!(q.finished_len().await, 3);
        assert_eq!(q.jobs().await.len(), 3);
        assert!(q.get(&retired[0]).await.is_none());
        assert!(q.get(&retired[496]).await.is_none());
        for uuid in &retired[497..] {
            assert!(q.get(uuid).await.is_some());
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let q = Arc::new(JobQueue::with_capacity(1, Arc::new(Notify::new())));
        q.add_job(job("a", 0, 1)).await.unwrap();
        assert!(matches!(
            q.add_job(job("b", 0, 1)).await,
            Err(GridError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn cancel_retires_job_without_in_flight_units() {
        let q = queue();
        let j = job("a", 0, 3);
        q.add_job(j.clone()).await.unwrap();
        assert!(q.cancel_job(j.uuid()).await.unwrap());
        assert!(!q.cancel_job(j.uuid()).await.unwrap());
        assert!(j.is_done());
        assert!(q.is_empty().await);
        assert!(q.get(&j.uuid()).await.is_some());
    }

    #[tokio::test]
    async fn cancel_unknown_job_fails() {
        let q = queue();
        assert!(matches!(
            q.cancel_job(Uuid::new_v4()).await,
            Err(GridError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_expands_per_node() {
        let q = queue();
        let parent = Arc::new(Job::new(
            JobSpec::new("bcast", ["hostname"]).with_sla(JobSla {
                broadcast: true,
                ..Default::default()
            }),
        ));
        q.add_job(parent.clone()).await.unwrap();
        assert!(q.is_empty().await);

        q.process_pending_broadcasts(&[]).await;
        assert!(q.has_pending_broadcasts().await);

        q.process_pending_broadcasts(&["n1".to_string(), "n2".to_string()])
            .await;
        assert_eq!(q.len().await, 2);
        assert_eq!(q.broadcast_jobs_for("n1").await.len(), 1);
        assert_eq!(q.cancel_broadcast_jobs("n2").await.len(), 1);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_delay_keeps_job_pending() {
        let q = queue();
        let j = Arc::new(Job::new(JobSpec::new("later", ["true"]).with_sla(JobSla {
            start_delay_ms: Some(500),
            ..Default::default()
        })));
        q.add_job(j.clone()).await.unwrap();
        assert!(j.lock().await.pending);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!j.lock().await.pending);
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_cancels_job() {
        let q = queue();
        let j = Arc::new(Job::new(JobSpec::new("short", ["true"]).with_sla(JobSla {
            expiration_ms: Some(100),
            ..Default::default()
        })));
        q.add_job(j.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = j.lock().await;
        assert!(state.expired);
        assert!(state.cancelled);
    }
}
