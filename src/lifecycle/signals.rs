//! OS signal handling for the acceptor.
//!
//! # Responsibilities
//! - Wait for SIGINT or SIGTERM
//! - Translate the first one into a shutdown trigger
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Session threads do not observe signals; they finish on their own EOFs

use tokio::signal::unix::{signal, SignalKind};

use crate::lifecycle::Shutdown;

/// Resolves when the process is asked to stop.
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    let received = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            "SIGINT"
        }
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(received)
}

/// Trigger `shutdown` on the first SIGINT or SIGTERM.
pub async fn watch_signals(shutdown: &Shutdown) -> std::io::Result<()> {
    let received = shutdown_signal().await?;
    tracing::info!(signal = received, "Shutdown signal received");
    shutdown.trigger();
    Ok(())
}
