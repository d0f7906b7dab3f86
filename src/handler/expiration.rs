//! Dispatch-expiration timers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::channel::NodeChannel;
use crate::driver::DriverContext;
use crate::scheduler::job::{BundleKey, DispatchUnit, ReturnReason};

/// Delayed actions keyed by dispatch unit.
///
/// Each action runs on its own tokio task. Scheduling a key again replaces
/// the previous action; an action that started running is no longer
/// cancellable.
#[derive(Debug)]
pub struct ScheduleHandler {
    name: &'static str,
    actions: Mutex<HashMap<BundleKey, AbortHandle>>,
}

impl ScheduleHandler {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            actions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn schedule<F>(self: &Arc<Self>, key: BundleKey, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::clone(self);
        let mut actions = self.actions.lock().await;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if handler.actions.lock().await.remove(&key).is_none() {
                return;
            }
            tracing::trace!(handler = handler.name, bundle = %key, "Scheduled action fired");
            action.await;
        });
        if let Some(previous) = actions.insert(key, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Cancel the action for `key`. Returns false if none was pending.
    pub async fn cancel_action(&self, key: &BundleKey) -> bool {
        match self.actions.lock().await.remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let mut actions = self.actions.lock().await;
        for (_, handle) in actions.drain() {
            handle.abort();
        }
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }
}

/// Arm the expiration timer of a unit that was just written to `channel`.
pub async fn schedule_expiration(ctx: &Arc<DriverContext>, channel: &Arc<NodeChannel>, unit: &DispatchUnit) {
    let Some(ms) = unit.job().sla().dispatch_expiration_ms else {
        return;
    };
    // broadcast units are pinned to one node and never expire
    if unit.job().broadcast_uuid().is_some() {
        return;
    }
    let key = unit.key();
    let action = dispatch_expired(Arc::clone(ctx), Arc::clone(channel), key);
    ctx.expirations
        .schedule(key, Duration::from_millis(ms), action)
        .await;
}

/// Timeout action: the unit is taken back from its channel (or from the
/// offline holder), its tasks are requeued or cancelled past
/// `max_dispatch_expirations`, and the node is told to stop.
pub async fn dispatch_expired(ctx: Arc<DriverContext>, channel: Arc<NodeChannel>, key: BundleKey) {
    let unit = {
        let mut state = channel.lock().await;
        let unit = channel.remove_entry(&mut state, &key);
        if unit.is_some() {
            channel.unit_returned(&mut state);
        }
        unit
    };
    let held = ctx.offline.remove(&key).await;
    let Some(unit) = unit.or(held) else {
        return;
    };

    expire(&ctx, &unit).await;
    if !channel.is_closed() {
        channel.cancel_job(key.job_uuid, key.bundle_id);
    }
}

async fn expire(ctx: &DriverContext, unit: &DispatchUnit) {
    unit.set_return_reason(ReturnReason::DispatchExpired);
    unit.set_expired();
    ctx.stats.dispatch_expired();
    let job = unit.job();
    let max_expirations = job.sla().max_dispatch_expirations;

    let (requeued, cancelled, completed) = {
        let mut state = job.lock().await;
        state.dispatches.remove(&unit.id());
        let no_retry = state.cancelled || job.broadcast_uuid().is_some();
        let mut retry = Vec::new();
        let mut give_up = Vec::new();
        for pos in unit.positions() {
            let Some(task) = state.task_mut(pos) else {
                continue;
            };
            if task.state.is_terminal() {
                continue;
            }
            task.expiration_count += 1;
            if no_retry || task.expiration_count > max_expirations {
                give_up.push(pos);
            } else {
                retry.push(pos);
            }
        }
        state.cancel_tasks(&give_up);
        let requeued = state.requeue(&retry);
        (requeued, give_up.len(), job.check_completion(&mut state))
    };

    tracing::warn!(
        job = %job.uuid(),
        bundle = unit.id(),
        requeued,
        cancelled,
        "Dispatch unit expired"
    );
    ctx.stats.tasks_resubmitted(requeued);
    ctx.stats.tasks_cancelled(cancelled);
    if requeued > 0 {
        ctx.queue.notify_bundle_added();
    }
    if completed {
        ctx.job_finished(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ExecutionStatus, NodeIdentity};
    use crate::config::DriverConfig;
    use crate::scheduler::job::{JobSpec, TaskState};
    use crate::scheduler::sla::JobSla;
    use crate::transport::message::Header;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn schedule_and_cancel() {
        let handler = Arc::new(ScheduleHandler::new("test"));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let a = BundleKey::new(Uuid::new_v4(), 1);
        let b = BundleKey::new(Uuid::new_v4(), 1);
        for key in [a, b] {
            let tx = tx.clone();
            handler
                .schedule(key, Duration::from_millis(100), async move {
                    let _ = tx.send(key);
                })
                .await;
        }
        assert_eq!(handler.len().await, 2);
        assert!(handler.cancel_action(&a).await);
        assert!(!handler.cancel_action(&a).await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.try_recv().unwrap(), b);
        assert!(rx.try_recv().is_err());
        assert!(handler.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_unit_is_requeued_then_cancelled() {
        let (ctx, _events) = DriverContext::new(DriverConfig::default());
        let (channel, mut out) = ctx.open_channel().await;
        channel
            .set_identity(NodeIdentity {
                node_uuid: "n1".into(),
                ..Default::default()
            })
            .unwrap();
        {
            let mut state = channel.lock().await;
            channel.set_status(&mut state, ExecutionStatus::Handshaking).unwrap();
            channel.set_status(&mut state, ExecutionStatus::Active).unwrap();
        }
        let mut sla = JobSla::default().with_dispatch_expiration_ms(50);
        sla.max_dispatch_expirations = 1;
        let job = ctx.submit_job(JobSpec::new("slow", ["sleep 10"]).with_sla(sla)).await.unwrap();

        for round in 1..=2u32 {
            let unit = ctx.queue.next_dispatch_unit(&job, 1).await.unwrap();
            {
                let mut state = channel.lock().await;
                channel.submit(&mut state, Arc::clone(&unit)).await.unwrap();
            }
            schedule_expiration(&ctx, &channel, &unit).await;
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(unit.is_expired());
            assert_eq!(job.lock().await.tasks[0].expiration_count, round);
            assert_eq!(channel.lock().await.current_jobs(), 0);
        }

        assert_eq!(job.lock().await.tasks[0].state, TaskState::Cancelled);
        assert!(job.is_done());
        assert_eq!(ctx.stats.snapshot().dispatch_expirations, 2);
        let mut cancels = 0;
        while let Ok(sent) = out.try_recv() {
            if matches!(sent.message.header, Header::Cancel { .. }) {
                cancels += 1;
            }
        }
        assert_eq!(cancels, 2);
    }
}
