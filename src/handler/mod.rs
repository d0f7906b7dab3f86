//! What happens to a dispatch unit once it leaves the matcher: results,
//! channel failures, dispatch expiration and offline delivery.

pub mod expiration;
pub mod failure;
pub mod offline;
pub mod results;

use crate::driver::DriverContext;
use crate::scheduler::job::DispatchUnit;

pub(crate) const RESUBMIT_LIMIT_REACHED: &str = "resubmit limit reached";

/// Put the tasks of a unit that came back without results back in the queue.
///
/// With `counted`, every task's resubmit count goes up and tasks past their
/// limit fail permanently. Units of cancelled jobs and broadcast units are
/// never resubmitted: their tasks are cancelled instead.
pub(crate) async fn resubmit_unit(ctx: &DriverContext, unit: &DispatchUnit, counted: bool) {
    let job = unit.job();
    let positions = unit.positions();
    let (requeued, failed, cancelled, completed) = {
        let mut state = job.lock().await;
        state.dispatches.remove(&unit.id());
        if state.cancelled || job.broadcast_uuid().is_some() {
            let open = positions
                .iter()
                .filter(|&&p| state.tasks.get(p).is_some_and(|t| !t.state.is_terminal()))
                .count();
            state.cancel_tasks(&positions);
            (0, 0, open, job.check_completion(&mut state))
        } else if counted {
            let mut retry = Vec::new();
            let mut exhausted = Vec::new();
            for &pos in &positions {
                let Some(task) = state.task_mut(pos) else {
                    continue;
                };
                if task.state.is_terminal() {
                    continue;
                }
                task.resubmit_count += 1;
                if task.resubmit_count <= task.resubmit_limit(job.sla()) {
                    retry.push(pos);
                } else {
                    exhausted.push(pos);
                }
            }
            state.fail(&exhausted, RESUBMIT_LIMIT_REACHED);
            let requeued = state.requeue(&retry);
            (requeued, exhausted.len(), 0, job.check_completion(&mut state))
        } else {
            let requeued = state.requeue(&positions);
            (requeued, 0, 0, job.check_completion(&mut state))
        }
    };
    unit.set_requeued();
    tracing::debug!(
        job = %job.uuid(),
        bundle = unit.id(),
        requeued,
        failed,
        cancelled,
        "Dispatch unit resubmitted"
    );

    ctx.stats.tasks_resubmitted(requeued);
    ctx.stats.tasks_failed(failed);
    ctx.stats.tasks_cancelled(cancelled);
    if requeued > 0 {
        ctx.queue.notify_bundle_added();
    }
    if completed {
        ctx.job_finished(job).await;
    }
}
