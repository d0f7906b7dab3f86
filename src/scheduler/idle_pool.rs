use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::channel::{ChannelState, ExecutionStatus, NodeChannel};
use crate::error::{GridError, Result};
use crate::scheduler::reservation::ReservationLedger;
use crate::stats::DriverStats;

/// Ordered set of channels that can take work right now.
///
/// A channel is a member only while it is `Active` and below its job cap.
/// Membership is advisory: the matcher re-validates a channel under its own
/// lock before dispatching to it.
///
/// Outside the matcher, mutations come from a single pool-membership updater
/// task fed by [`PoolEvent`](crate::channel::PoolEvent)s, so the pool lock
/// is never requested while a channel lock is held.
#[derive(Debug)]
pub struct IdlePool {
    channels: Mutex<Vec<Arc<NodeChannel>>>,
    reservations: Arc<ReservationLedger>,
    stats: Arc<DriverStats>,
    wake: Arc<Notify>,
}

impl IdlePool {
    pub fn new(reservations: Arc<ReservationLedger>, stats: Arc<DriverStats>, wake: Arc<Notify>) -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            reservations,
            stats,
            wake,
        }
    }

    /// Acquire the pool lock, e.g. to scan members while matching.
    pub async fn lock(&self) -> MutexGuard<'_, Vec<Arc<NodeChannel>>> {
        self.channels.lock().await
    }

    /// Add a channel. Fails with `InvalidState` unless it is `Active`.
    ///
    /// Returns false without adding when the channel is already a member or
    /// has no free job slot. On add, a pending reservation for the node is
    /// promoted to ready, otherwise a stale reservation is cleared.
    pub async fn add(&self, channel: &Arc<NodeChannel>) -> Result<bool> {
        let mut idle = self.channels.lock().await;
        let mut state = channel.lock().await;
        if state.status() != ExecutionStatus::Active {
            return Err(GridError::InvalidState(format!(
                "cannot add channel {} to idle pool: status is {}",
                channel.id(),
                state.status()
            )));
        }
        if !state.has_capacity() || idle.iter().any(|c| Arc::ptr_eq(c, channel)) {
            return Ok(false);
        }
        idle.push(Arc::clone(channel));
        state.idle = true;

        let node = channel.uuid().to_string();
        if self.reservations.transition_reservation(&node, &state.system_info).await {
            state.keep_reservation = false;
        } else if !state.keep_reservation {
            self.reservations.remove_reservation(&node).await;
        }

        self.stats.set_idle_nodes(idle.len());
        tracing::debug!(channel = %channel.id(), node = %node, idle = idle.len(), "Channel added to idle pool");
        self.wake.notify_one();
        Ok(true)
    }

    pub async fn remove(&self, channel: &Arc<NodeChannel>) -> bool {
        let mut idle = self.channels.lock().await;
        let mut state = channel.lock().await;
        self.remove_locked(&mut idle, channel, &mut state)
    }

    /// Remove while already holding the pool and channel locks.
    pub fn remove_locked(
        &self,
        idle: &mut Vec<Arc<NodeChannel>>,
        channel: &NodeChannel,
        state: &mut ChannelState,
    ) -> bool {
        state.idle = false;
        let before = idle.len();
        idle.retain(|c| !std::ptr::eq(c.as_ref(), channel));
        let removed = idle.len() != before;
        if removed {
            self.stats.set_idle_nodes(idle.len());
            tracing::debug!(channel = %channel.id(), idle = idle.len(), "Channel removed from idle pool");
            self.wake.notify_one();
        }
        removed
    }

    /// Copy of the current members, in insertion order.
    pub async fn snapshot(&self) -> Vec<Arc<NodeChannel>> {
        self.channels.lock().await.clone()
    }

    pub async fn size(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty()
    }
}
