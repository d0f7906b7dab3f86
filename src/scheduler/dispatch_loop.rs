use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::driver::DriverContext;
use crate::scheduler::matcher::DispatchMatcher;

/// Run the matcher until `shutdown` fires.
///
/// After a successful dispatch the loop goes straight back to matching.
/// Otherwise it waits for a wake-up (new work, pool change) or for
/// `idle_wait_ms`, whichever comes first. A failing or panicking iteration
/// is logged and the loop carries on.
pub async fn run_dispatch_loop(ctx: Arc<DriverContext>, shutdown: CancellationToken) {
    let matcher = DispatchMatcher::new(Arc::clone(&ctx));
    let idle_wait = Duration::from_millis(ctx.config.scheduler.idle_wait_ms.max(1));
    tracing::info!(idle_wait_ms = idle_wait.as_millis() as u64, "Dispatch loop started");

    while !shutdown.is_cancelled() {
        let matched = match AssertUnwindSafe(matcher.try_dispatch_one()).catch_unwind().await {
            Ok(Ok(matched)) => matched,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Dispatch iteration failed");
                false
            }
            Err(_) => {
                tracing::error!("Dispatch iteration panicked");
                false
            }
        };
        if matched {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ctx.wake.notified() => {
                tracing::trace!("Dispatch loop woken");
            }
            _ = tokio::time::sleep(idle_wait) => {}
        }
    }

    tracing::info!("Dispatch loop stopped");
}
