//! Default shutdown signal source.
//!
//! Servers constructed without an external cancellation token fall back to
//! the process signals a supervisor sends: SIGTERM (termination, typically
//! from an orchestrator) and SIGINT (Ctrl+C). Unix-only, like the rest of
//! our deploy targets.

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Completes when a shutdown signal is received.
pub(crate) async fn wait_for_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = interrupt.recv() => tracing::info!("received SIGINT, shutting down"),
    }
}

/// Cancel `token` once an OS shutdown signal arrives.
pub(crate) fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });
}
