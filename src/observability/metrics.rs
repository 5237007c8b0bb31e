//! Metrics collection and exposition.
//!
//! # Metrics
//! - `recorder_connections_total` (counter): connections accepted
//! - `recorder_active_sessions` (gauge): live session threads
//! - `recorder_records_written_total` (counter): record files written
//! - `recorder_record_bytes_total` (counter): encoded record bytes written
//! - `recorder_session_errors_total` (counter, label `kind`): sessions that
//!   ended with an error
//!
//! Metric updates go through the `metrics` facade and are no-ops until a
//! recorder is installed.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const CONNECTIONS_TOTAL: &str = "recorder_connections_total";
pub const ACTIVE_SESSIONS: &str = "recorder_active_sessions";
pub const RECORDS_WRITTEN_TOTAL: &str = "recorder_records_written_total";
pub const RECORD_BYTES_TOTAL: &str = "recorder_record_bytes_total";
pub const SESSION_ERRORS_TOTAL: &str = "recorder_session_errors_total";

/// Serve Prometheus text format on `addr` and install the global recorder.
///
/// Must be called from within the tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection() {
    metrics::counter!(CONNECTIONS_TOTAL).increment(1);
}

pub fn record_session_error(kind: &'static str) {
    metrics::counter!(SESSION_ERRORS_TOTAL, "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_connection();
            record_session_error("pairing");
        });

        let output = handle.render();
        assert!(output.contains("recorder_connections_total 1"));
        assert!(output.contains("recorder_session_errors_total{kind=\"pairing\"} 1"));
    }
}
