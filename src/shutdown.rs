use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// A driver or node agent passes the token down to its server loop, its
/// dispatch loop and its connections. `role` only labels the log line.
pub fn install_shutdown_handler(role: &'static str) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => tracing::info!(role, signal = name, "Stopping"),
            Err(e) => {
                // without handlers the process can only be killed
                tracing::error!(role, error = %e, "Failed to install signal handlers");
                return;
            }
        }
        trigger.cancel();
    });

    token
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}
