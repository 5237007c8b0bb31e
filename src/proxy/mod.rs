//! Transparent recording proxy.
//!
//! # Data Flow
//! ```text
//! Listener::accept (tokio)
//!     → into_std, blocking mode
//!     → detached OS thread "session-<id>"
//!         → Session::open (resolve original destination, connect)
//!         → Session::run (poll both legs, record pairs)
//!         → errors logged, counted, and swallowed at the thread boundary
//! ```
//!
//! # Design Decisions
//! - Thread per connection; each thread owns its session exclusively
//! - The acceptor never waits on a session, except for the bounded drain
//!   at shutdown

pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::config::RecorderConfig;
use crate::net::{ConnectionPermit, ConnectionTracker, DestinationResolver, Listener, ListenerError};
use crate::observability::metrics::{record_connection, record_session_error};
use crate::record::RecordWriter;

pub use session::{Session, SessionError};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts intercepted connections and hands each to its own session thread.
pub struct RecordingProxy {
    config: Arc<RecorderConfig>,
    resolver: Arc<dyn DestinationResolver>,
    writer: RecordWriter,
    tracker: ConnectionTracker,
}

impl RecordingProxy {
    pub fn new(config: RecorderConfig, resolver: Arc<dyn DestinationResolver>) -> Self {
        let writer = RecordWriter::with_mode(
            config.recording.output_dir.clone(),
            config.recording.file_mode,
        );
        Self {
            config: Arc::new(config),
            resolver,
            writer,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Live sessions.
    pub fn active_sessions(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Accept until `shutdown` fires, then drain live sessions.
    pub async fn run(
        &self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ProxyError> {
        tracing::info!(
            address = %listener.local_addr()?,
            output_dir = %self.writer.dir().display(),
            "Recording proxy starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        record_connection();
                        if let Err(e) = self.spawn_session(stream, peer, permit) {
                            tracing::warn!(peer_addr = %peer, error = %e, "Failed to start session");
                        }
                    }
                    Err(ListenerError::LimitClosed) => break,
                    Err(e) => accept_failed(&e).await,
                },
            }
        }

        drop(listener);
        let live = self.tracker.active_count();
        tracing::info!(live_sessions = live, "Stopped accepting, draining sessions");

        if !self.tracker.wait_for_drain(self.config.timeouts.drain()).await {
            tracing::warn!(
                live_sessions = self.tracker.active_count(),
                "Drain deadline passed with sessions still open"
            );
        }

        tracing::info!("Recording proxy stopped");
        Ok(())
    }

    fn spawn_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
    ) -> std::io::Result<()> {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;

        let guard = self.tracker.track();
        let id = guard.id();
        let config = Arc::clone(&self.config);
        let resolver = Arc::clone(&self.resolver);
        let writer = self.writer.clone();

        thread::Builder::new()
            .name(format!("session-{}", id.as_u64()))
            .spawn(move || {
                let _permit = permit;
                let _guard = guard;

                let result = Session::open(stream, resolver.as_ref(), &config, writer, id)
                    .and_then(Session::run);

                if let Err(e) = result {
                    record_session_error(e.kind());
                    tracing::warn!(
                        connection_id = %id,
                        peer_addr = %peer,
                        kind = e.kind(),
                        error = %e,
                        "Session ended with error"
                    );
                }
            })?;

        Ok(())
    }
}

/// Log a failed accept and back off.
///
/// Errors like EMFILE persist until sessions finish, so retrying at once
/// would spin.
async fn accept_failed(error: &ListenerError) {
    tracing::warn!(error = %error, "Accept failed");
    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn accept_failure_backs_off() {
        let start = tokio::time::Instant::now();
        let error = ListenerError::Accept(std::io::Error::from_raw_os_error(libc::EMFILE));

        accept_failed(&error).await;

        assert!(start.elapsed() >= ACCEPT_RETRY_DELAY);
    }
}
