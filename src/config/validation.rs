//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse, mode bits)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Pure function: &RecorderConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::RecorderConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &RecorderConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new(
            "listener.max_connections",
            "must be greater than zero",
        ));
    }

    if config.recording.output_dir.as_os_str().is_empty() {
        errors.push(ValidationError::new("recording.output_dir", "must not be empty"));
    }
    if config.recording.file_mode & !0o777 != 0 {
        errors.push(ValidationError::new(
            "recording.file_mode",
            format!("{:#o} has bits outside 0o777", config.recording.file_mode),
        ));
    } else if config.recording.file_mode & 0o600 != 0o600 {
        errors.push(ValidationError::new(
            "recording.file_mode",
            "owner must be able to read and write records",
        ));
    }

    if let Some(dest) = &config.upstream.fixed_destination {
        check_address(&mut errors, "upstream.fixed_destination", dest);
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than zero"));
    }
    if config.timeouts.poll_secs == 0 {
        errors.push(ValidationError::new("timeouts.poll_secs", "must be greater than zero"));
    }

    if config.session.read_buffer_bytes == 0 {
        errors.push(ValidationError::new(
            "session.read_buffer_bytes",
            "must be greater than zero",
        ));
    }

    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            format!("unknown format {:?}, expected \"pretty\" or \"json\"", config.observability.log_format),
        ));
    }
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if let Err(e) = value.parse::<SocketAddr>() {
        errors.push(ValidationError::new(field, format!("{value:?} is not a socket address: {e}")));
    }
}
