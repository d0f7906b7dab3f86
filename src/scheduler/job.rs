use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, MutexGuard};
use uuid::Uuid;

use crate::scheduler::sla::JobSla;

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of one task inside the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Dispatched { bundle_id: u64 },
    Returned,
    Failed { reason: String },
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Returned | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct ServerTask {
    pub position: usize,
    pub payload: Bytes,
    pub max_resubmits: Option<u32>,
    pub resubmit_count: u32,
    pub expiration_count: u32,
    pub state: TaskState,
    pub result: Option<Bytes>,
    pub returned_from_node: bool,
}

impl ServerTask {
    /// `min(job.max_task_resubmits, task.max_resubmits)`
    pub fn resubmit_limit(&self, sla: &JobSla) -> u32 {
        self.max_resubmits
            .map_or(sla.max_task_resubmits, |m| m.min(sla.max_task_resubmits))
    }
}

/// Submission form of a job, as received over the management API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub sla: JobSla,
    #[serde(default)]
    pub metadata: Metadata,
    /// Shared data sent once with every bundle of the job
    #[serde(default)]
    pub data: String,
    pub tasks: Vec<TaskSpec>,
    /// Drivers this job already went through
    #[serde(default)]
    pub uuid_path: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub command: String,
    #[serde(default)]
    pub max_resubmits: Option<u32>,
}

impl JobSpec {
    pub fn new<I, S>(name: &str, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            tasks: commands
                .into_iter()
                .map(|c| TaskSpec {
                    command: c.into(),
                    max_resubmits: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_sla(mut self, sla: JobSla) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Mutable part of a job, guarded by the job lock.
#[derive(Debug)]
pub struct JobState {
    pub cancelled: bool,
    pub suspended: bool,
    /// Waiting for its start delay
    pub pending: bool,
    pub expired: bool,
    pub tasks: Vec<ServerTask>,
    /// Positions waiting to be dispatched, in dispatch order
    pub queued: VecDeque<usize>,
    /// In-flight dispatch units: bundle id -> channel id
    pub dispatches: HashMap<u64, String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobState {
    /// Number of distinct channels currently holding a unit of this job.
    pub fn nb_channels(&self) -> usize {
        self.dispatches.values().collect::<HashSet<_>>().len()
    }

    pub fn channel_ids(&self) -> HashSet<String> {
        self.dispatches.values().cloned().collect()
    }

    pub fn has_queued_tasks(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn task_mut(&mut self, position: usize) -> Option<&mut ServerTask> {
        self.tasks.get_mut(position)
    }

    /// Put tasks back in the dispatch queue. Already-terminal tasks are skipped.
    /// Returns how many were requeued.
    pub fn requeue(&mut self, positions: &[usize]) -> usize {
        let mut count = 0;
        for &pos in positions {
            if let Some(task) = self.tasks.get_mut(pos) {
                if task.state.is_terminal() || task.state == TaskState::Queued {
                    continue;
                }
                task.state = TaskState::Queued;
                task.returned_from_node = false;
                self.queued.push_back(pos);
                count += 1;
            }
        }
        count
    }

    pub fn fail(&mut self, positions: &[usize], reason: &str) {
        for &pos in positions {
            if let Some(task) = self.tasks.get_mut(pos) {
                if !task.state.is_terminal() {
                    task.state = TaskState::Failed {
                        reason: reason.to_string(),
                    };
                }
            }
        }
    }

    pub fn cancel_tasks(&mut self, positions: &[usize]) {
        for &pos in positions {
            if let Some(task) = self.tasks.get_mut(pos) {
                if !task.state.is_terminal() {
                    task.state = TaskState::Cancelled;
                }
            }
        }
    }

    /// Cancel every task still waiting in the queue.
    pub fn cancel_queued(&mut self) -> usize {
        let queued: Vec<usize> = self.queued.drain(..).collect();
        self.cancel_tasks(&queued);
        queued.len()
    }

    pub fn is_complete(&self) -> bool {
        self.queued.is_empty()
            && self.dispatches.is_empty()
            && self.tasks.iter().all(|t| t.state.is_terminal())
    }

    pub fn status(&self) -> JobStatus {
        if self.completed_at.is_some() {
            if self.cancelled {
                JobStatus::Cancelled
            } else {
                JobStatus::Completed
            }
        } else if self.dispatches.is_empty() && self.tasks.iter().all(|t| !t.returned_from_node) {
            JobStatus::Pending
        } else {
            JobStatus::Running
        }
    }
}

/// A job queued on the driver.
///
/// Immutable submission data sits directly on the struct; everything that
/// changes while the job runs lives in [`JobState`] behind the job lock.
#[derive(Debug)]
pub struct Job {
    uuid: Uuid,
    name: String,
    sla: JobSla,
    metadata: Metadata,
    data: Bytes,
    uuid_path: Vec<String>,
    broadcast_uuid: Option<String>,
    broadcast_parent: Option<Uuid>,
    created_at: DateTime<Utc>,
    next_bundle_id: AtomicU64,
    state: Mutex<JobState>,
    done_tx: watch::Sender<bool>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let tasks: Vec<ServerTask> = spec
            .tasks
            .into_iter()
            .enumerate()
            .map(|(position, t)| ServerTask {
                position,
                payload: Bytes::from(t.command.into_bytes()),
                max_resubmits: t.max_resubmits,
                resubmit_count: 0,
                expiration_count: 0,
                state: TaskState::Queued,
                result: None,
                returned_from_node: false,
            })
            .collect();
        let queued = (0..tasks.len()).collect();
        let (done_tx, _) = watch::channel(false);

        Self {
            uuid: spec.uuid.unwrap_or_else(Uuid::new_v4),
            name: spec.name,
            state: Mutex::new(JobState {
                cancelled: false,
                suspended: spec.sla.suspended,
                pending: spec.sla.start_delay_ms.is_some(),
                expired: false,
                tasks,
                queued,
                dispatches: HashMap::new(),
                completed_at: None,
            }),
            sla: spec.sla,
            metadata: spec.metadata,
            data: Bytes::from(spec.data.into_bytes()),
            uuid_path: spec.uuid_path,
            broadcast_uuid: None,
            broadcast_parent: None,
            created_at: Utc::now(),
            next_bundle_id: AtomicU64::new(1),
            done_tx,
        }
    }

    /// A copy of `parent` pinned to one node, used for broadcast expansion.
    pub(crate) fn broadcast_child(parent: &Job, tasks: Vec<ServerTask>, node_uuid: &str) -> Self {
        let mut sla = parent.sla.clone();
        sla.broadcast = false;
        sla.max_nodes = 1;
        let queued = (0..tasks.len()).collect();
        let (done_tx, _) = watch::channel(false);
        Self {
            uuid: Uuid::new_v4(),
            name: format!("{} [node {}]", parent.name, node_uuid),
            state: Mutex::new(JobState {
                cancelled: false,
                suspended: sla.suspended,
                pending: false,
                expired: false,
                tasks,
                queued,
                dispatches: HashMap::new(),
                completed_at: None,
            }),
            sla,
            metadata: parent.metadata.clone(),
            data: parent.data.clone(),
            uuid_path: parent.uuid_path.clone(),
            broadcast_uuid: Some(node_uuid.to_string()),
            broadcast_parent: Some(parent.uuid),
            created_at: Utc::now(),
            next_bundle_id: AtomicU64::new(1),
            done_tx,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sla(&self) -> &JobSla {
        &self.sla
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn uuid_path(&self) -> &[String] {
        &self.uuid_path
    }

    /// Node this job is pinned to, for broadcast children.
    pub fn broadcast_uuid(&self) -> Option<&str> {
        self.broadcast_uuid.as_deref()
    }

    pub fn broadcast_parent(&self) -> Option<Uuid> {
        self.broadcast_parent
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire the job lock.
    pub async fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().await
    }

    pub async fn is_cancelled(&self) -> bool {
        self.state.lock().await.cancelled
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Wait until every task reached a terminal state.
    pub async fn wait_done(&self) {
        let mut rx = self.done_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Mark the job done if every task is terminal. Returns true on the
    /// transition, so callers can retire the job exactly once.
    pub fn check_completion(&self, state: &mut JobState) -> bool {
        if state.completed_at.is_none() && state.is_complete() {
            state.completed_at = Some(Utc::now());
            self.done_tx.send_replace(true);
            tracing::info!(job = %self.uuid, name = %self.name, cancelled = state.cancelled, "Job completed");
            return true;
        }
        false
    }

    /// Take up to `size` queued tasks into a new dispatch unit.
    ///
    /// Must be called with the job lock held (`state`). Returns `None` when
    /// nothing is queued.
    pub fn create_dispatch_unit(
        self: &Arc<Self>,
        state: &mut JobState,
        size: usize,
    ) -> Option<DispatchUnit> {
        let size = size.max(1).min(state.queued.len());
        if size == 0 {
            return None;
        }
        let id = self.next_bundle_id.fetch_add(1, Ordering::Relaxed);
        let mut tasks = Vec::with_capacity(size);
        for _ in 0..size {
            let Some(pos) = state.queued.pop_front() else {
                break;
            };
            if let Some(task) = state.tasks.get_mut(pos) {
                task.state = TaskState::Dispatched { bundle_id: id };
                tasks.push(UnitTask {
                    position: pos,
                    payload: task.payload.clone(),
                });
            }
        }
        Some(DispatchUnit::new(id, Arc::clone(self), tasks))
    }
}

/// Lookup key of an in-flight dispatch unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleKey {
    pub job_uuid: Uuid,
    pub bundle_id: u64,
}

impl BundleKey {
    pub fn new(job_uuid: Uuid, bundle_id: u64) -> Self {
        Self {
            job_uuid,
            bundle_id,
        }
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.job_uuid, self.bundle_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnReason {
    ResultsReceived = 1,
    NodeProcessingError = 2,
    NodeChannelError = 3,
    DispatchExpired = 4,
    DriverProcessingError = 5,
    Cancelled = 6,
}

impl ReturnReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ResultsReceived),
            2 => Some(Self::NodeProcessingError),
            3 => Some(Self::NodeChannelError),
            4 => Some(Self::DispatchExpired),
            5 => Some(Self::DriverProcessingError),
            6 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitTask {
    pub position: usize,
    pub payload: Bytes,
}

/// A job-scoped slice of tasks sent to exactly one channel.
#[derive(Debug)]
pub struct DispatchUnit {
    id: u64,
    job: Arc<Job>,
    tasks: Vec<UnitTask>,
    started: Instant,
    cancelled: AtomicBool,
    expired: AtomicBool,
    offline: AtomicBool,
    requeued: AtomicBool,
    return_reason: AtomicU8,
}

impl DispatchUnit {
    fn new(id: u64, job: Arc<Job>, tasks: Vec<UnitTask>) -> Self {
        Self {
            id,
            job,
            tasks,
            started: Instant::now(),
            cancelled: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            requeued: AtomicBool::new(false),
            return_reason: AtomicU8::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> BundleKey {
        BundleKey::new(self.job.uuid(), self.id)
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn tasks(&self) -> &[UnitTask] {
        &self.tasks
    }

    pub fn positions(&self) -> Vec<usize> {
        self.tasks.iter().map(|t| t.position).collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// When the unit was handed to its channel.
    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn set_expired(&self) {
        self.expired.store(true, Ordering::Release);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn is_requeued(&self) -> bool {
        self.requeued.load(Ordering::Acquire)
    }

    pub fn set_requeued(&self) {
        self.requeued.store(true, Ordering::Release);
    }

    pub fn return_reason(&self) -> Option<ReturnReason> {
        ReturnReason::from_u8(self.return_reason.load(Ordering::Acquire))
    }

    pub fn set_return_reason(&self, reason: ReturnReason) {
        self.return_reason.store(reason as u8, Ordering::Release);
    }
}
