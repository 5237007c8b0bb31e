//! Transparent HTTP recording proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                 iptables REDIRECT
//!     Client ─────────────────────────┐
//!                                     ▼
//!                         ┌───────────────────────┐
//!                         │   net::Listener       │  tokio accept loop
//!                         └──────────┬────────────┘
//!                                    │ one OS thread per connection
//!                                    ▼
//!                         ┌───────────────────────┐
//!                         │   proxy::Session      │  poll(2) over both legs
//!                         │  http parsers         │
//!                         │  record::PendingPairs │
//!                         └───┬──────────────┬────┘
//!                             │              │
//!                             ▼              ▼
//!                  original destination   record::RecordWriter
//!                  (SO_ORIGINAL_DST)      <output_dir>/<random u64>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use record_proxy::config::{load_config, validate_config, ConfigError, RecorderConfig};
use record_proxy::lifecycle::{prepare_output_dir, watch_signals, Shutdown};
use record_proxy::net::{DestinationResolver, FixedDestination, Listener, OriginalDestination};
use record_proxy::observability::{init_logging, init_metrics};
use record_proxy::proxy::RecordingProxy;

#[derive(Parser, Debug)]
#[command(name = "record-proxy")]
#[command(about = "Transparent proxy that records HTTP request/response pairs", long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Record directory, overrides `recording.output_dir`.
    #[arg(short, long)]
    record_dir: Option<PathBuf>,

    /// Forward everything here instead of the original destination.
    #[arg(short, long)]
    destination: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<RecorderConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => RecorderConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(dir) = self.record_dir {
            config.recording.output_dir = dir;
        }
        if let Some(dest) = self.destination {
            config.upstream.fixed_destination = Some(dest);
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;
    init_logging(&config.observability);

    tracing::info!("record-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        output_dir = %config.recording.output_dir.display(),
        fixed_destination = ?config.upstream.fixed_destination,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        // Validation guarantees the address parses.
        init_metrics(config.observability.metrics_address.parse()?)?;
    }

    prepare_output_dir(&config.recording.output_dir)?;

    let resolver: Arc<dyn DestinationResolver> = match &config.upstream.fixed_destination {
        Some(dest) => Arc::new(FixedDestination(dest.parse()?)),
        None => Arc::new(OriginalDestination),
    };

    let listener = Listener::bind(&config.listener).await?;
    let proxy = RecordingProxy::new(config, resolver);

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();

    let serve = proxy.run(listener, receiver);
    tokio::pin!(serve);

    tokio::select! {
        res = &mut serve => res?,
        res = watch_signals(&shutdown) => {
            res?;
            serve.await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
