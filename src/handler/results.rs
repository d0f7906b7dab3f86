use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::channel::NodeChannel;
use crate::driver::DriverContext;
use crate::handler::resubmit_unit;
use crate::scheduler::job::{BundleKey, DispatchUnit, ReturnReason, TaskState};
use crate::transport::message::ResultHeader;

/// Process a result message for a unit in flight on `channel`.
///
/// A result for a unit that is no longer in flight (already processed,
/// expired or failed over) is ignored.
pub async fn handle_result(ctx: &DriverContext, channel: &Arc<NodeChannel>, header: ResultHeader, results: Vec<Bytes>) {
    let key = BundleKey::new(header.job_uuid, header.bundle_id);
    let unit = {
        let mut state = channel.lock().await;
        channel.remove_entry(&mut state, &key)
    };
    let Some(unit) = unit else {
        tracing::debug!(channel = %channel.id(), bundle = %key, "Result for a unit no longer in flight, ignored");
        return;
    };
    ctx.expirations.cancel_action(&key).await;

    let job = Arc::clone(unit.job());
    let must_process = {
        let mut state = job.lock().await;
        if state.cancelled {
            false
        } else {
            for pos in unit.positions() {
                if let Some(task) = state.task_mut(pos) {
                    task.returned_from_node = true;
                }
            }
            true
        }
    };

    if must_process {
        if process_results(ctx, channel, &unit, &header, results).await {
            resubmit_unit(ctx, &unit, false).await;
        }
    } else {
        discard_cancelled(ctx, &unit).await;
    }

    let mut state = channel.lock().await;
    if !channel.is_offline() {
        if let Some(max_jobs) = header.max_jobs {
            channel.set_max_jobs(&mut state, max_jobs);
        }
    }
    if let Some(info) = &header.system_info {
        state.system_info.merge(info);
    }
    channel.unit_returned(&mut state);
}

/// Returns true when the node asked for the whole unit to be requeued.
async fn process_results(
    ctx: &DriverContext,
    channel: &NodeChannel,
    unit: &DispatchUnit,
    header: &ResultHeader,
    results: Vec<Bytes>,
) -> bool {
    let job = unit.job();
    if header.requeue {
        tracing::debug!(job = %job.uuid(), bundle = unit.id(), node = %channel.uuid(), "Node requested requeue");
        return true;
    }

    if let Some(error) = &header.exception {
        unit.set_return_reason(ReturnReason::NodeProcessingError);
        tracing::warn!(
            job = %job.uuid(),
            bundle = unit.id(),
            node = %channel.uuid(),
            error = %error,
            "Node failed to process unit"
        );
        let positions = unit.positions();
        let (failed, completed) = {
            let mut state = job.lock().await;
            if state.cancelled {
                drop(state);
                discard_cancelled(ctx, unit).await;
                return false;
            }
            state.dispatches.remove(&unit.id());
            let open = positions
                .iter()
                .filter(|&&p| state.tasks.get(p).is_some_and(|t| !t.state.is_terminal()))
                .count();
            state.fail(&positions, error);
            (open, job.check_completion(&mut state))
        };
        ctx.stats.tasks_failed(failed);
        if completed {
            ctx.job_finished(job).await;
        }
        return false;
    }

    unit.set_return_reason(ReturnReason::ResultsReceived);
    let round_trip = unit.started().elapsed();
    let node_elapsed = header.node_elapsed_ms.map(Duration::from_millis);
    {
        let mut state = channel.lock().await;
        NodeChannel::feedback(&mut state, unit.task_count(), round_trip, node_elapsed);
    }
    let round_trip_ms = round_trip.as_millis() as u64;
    ctx.stats
        .execution(round_trip_ms, header.node_elapsed_ms.unwrap_or(round_trip_ms));

    let positions = unit.positions();
    let mut resubmit = HashSet::new();
    for &pos in header.resubmit_positions.iter().flatten() {
        if positions.contains(&pos) {
            resubmit.insert(pos);
        } else {
            tracing::warn!(job = %job.uuid(), bundle = unit.id(), position = pos, "Resubmit position not in unit, ignored");
        }
    }

    let (returned, missing, requeued, completed) = {
        let mut state = job.lock().await;
        if state.cancelled {
            drop(state);
            discard_cancelled(ctx, unit).await;
            return false;
        }
        state.dispatches.remove(&unit.id());
        let mut retry = Vec::new();
        let mut returned = 0;
        let mut missing = 0;
        for (i, unit_task) in unit.tasks().iter().enumerate() {
            let pos = unit_task.position;
            let Some(task) = state.task_mut(pos) else {
                continue;
            };
            if task.state.is_terminal() {
                continue;
            }
            if resubmit.contains(&pos) {
                task.resubmit_count += 1;
                if task.resubmit_count <= task.resubmit_limit(job.sla()) {
                    retry.push(pos);
                    continue;
                }
            }
            match results.get(i) {
                Some(result) => {
                    task.result = Some(result.clone());
                    task.state = TaskState::Returned;
                    returned += 1;
                }
                None => {
                    task.state = TaskState::Failed {
                        reason: "no result returned".to_string(),
                    };
                    missing += 1;
                }
            }
        }
        let requeued = state.requeue(&retry);
        (returned, missing, requeued, job.check_completion(&mut state))
    };

    if missing > 0 {
        unit.set_return_reason(ReturnReason::DriverProcessingError);
        tracing::warn!(
            job = %job.uuid(),
            bundle = unit.id(),
            expected = unit.task_count(),
            received = results.len(),
            "Result message is missing task results"
        );
    }
    tracing::debug!(job = %job.uuid(), bundle = unit.id(), returned, requeued, "Results received");
    ctx.stats.tasks_completed(returned);
    ctx.stats.tasks_failed(missing);
    ctx.stats.tasks_resubmitted(requeued);
    if requeued > 0 {
        ctx.queue.notify_bundle_added();
    }
    if completed {
        ctx.job_finished(job).await;
    }
    false
}

/// Cancel path: results of a cancelled job are dropped and the unit's
/// dispatch entry is cleared. Tasks that already returned keep their result.
pub(crate) async fn discard_cancelled(ctx: &DriverContext, unit: &DispatchUnit) {
    unit.set_cancelled();
    unit.set_return_reason(ReturnReason::Cancelled);
    let job = unit.job();
    let positions = unit.positions();
    let (cancelled, completed) = {
        let mut state = job.lock().await;
        state.dispatches.remove(&unit.id());
        let open = positions
            .iter()
            .filter(|&&p| state.tasks.get(p).is_some_and(|t| !t.state.is_terminal()))
            .count();
        state.cancel_tasks(&positions);
        (open, job.check_completion(&mut state))
    };
    tracing::debug!(job = %job.uuid(), bundle = unit.id(), "Results of cancelled job discarded");
    ctx.stats.tasks_cancelled(cancelled);
    if completed {
        ctx.job_finished(job).await;
    }
}
