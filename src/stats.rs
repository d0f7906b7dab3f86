use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Driver counters and gauges, updated lock-free from any task.
#[derive(Debug, Default)]
pub struct DriverStats {
    nodes: AtomicU64,
    peers: AtomicU64,
    idle_nodes: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_resubmitted: AtomicU64,
    tasks_cancelled: AtomicU64,
    dispatch_expirations: AtomicU64,
    execution_ms: AtomicU64,
    node_execution_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub nodes: u64,
    pub peers: u64,
    pub idle_nodes: u64,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_resubmitted: u64,
    pub tasks_cancelled: u64,
    pub dispatch_expirations: u64,
    pub execution_ms: u64,
    pub node_execution_ms: u64,
    pub transport_ms: u64,
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn sub(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl DriverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_connected(&self, peer: bool) {
        add(if peer { &self.peers } else { &self.nodes }, 1);
    }

    pub fn node_disconnected(&self, peer: bool) {
        sub(if peer { &self.peers } else { &self.nodes });
    }

    /// Connected real nodes (peers excluded).
    pub fn real_nodes(&self) -> usize {
        self.nodes.load(Ordering::Relaxed) as usize
    }

    pub fn set_idle_nodes(&self, n: usize) {
        self.idle_nodes.store(n as u64, Ordering::Relaxed);
    }

    pub fn job_submitted(&self) {
        add(&self.jobs_submitted, 1);
    }

    pub fn job_completed(&self) {
        add(&self.jobs_completed, 1);
    }

    pub fn tasks_dispatched(&self, n: usize) {
        add(&self.tasks_dispatched, n as u64);
    }

    pub fn tasks_completed(&self, n: usize) {
        add(&self.tasks_completed, n as u64);
    }

    pub fn tasks_failed(&self, n: usize) {
        add(&self.tasks_failed, n as u64);
    }

    pub fn tasks_resubmitted(&self, n: usize) {
        add(&self.tasks_resubmitted, n as u64);
    }

    pub fn tasks_cancelled(&self, n: usize) {
        add(&self.tasks_cancelled, n as u64);
    }

    pub fn dispatch_expired(&self) {
        add(&self.dispatch_expirations, 1);
    }

    /// Round trip and in-node time of a returned unit.
    pub fn execution(&self, round_trip_ms: u64, node_ms: u64) {
        add(&self.execution_ms, round_trip_ms);
        add(&self.node_execution_ms, node_ms);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let execution_ms = self.execution_ms.load(Ordering::Relaxed);
        let node_execution_ms = self.node_execution_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            nodes: self.nodes.load(Ordering::Relaxed),
            peers: self.peers.load(Ordering::Relaxed),
            idle_nodes: self.idle_nodes.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_resubmitted: self.tasks_resubmitted.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            dispatch_expirations: self.dispatch_expirations.load(Ordering::Relaxed),
            execution_ms,
            node_execution_ms,
            transport_ms: execution_ms.saturating_sub(node_execution_ms),
        }
    }
}
