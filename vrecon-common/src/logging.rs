//! Logging initialization using tracing.

use anyhow::{anyhow, Result};
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level names accepted by [`init_logging`] and the config file.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Whether `level` is one of [`LOG_LEVELS`], ignoring case.
pub fn is_valid_level(level: &str) -> bool {
    LOG_LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level))
}

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// # Example
/// ```no_run
/// vrecon_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

/// Initialize logging with JSON output format.
/// Suitable for running under an orchestrator that collects logs.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

/// Logs the duration of an operation when it completes.
pub struct TimedOperation {
    name: String,
    started: Instant,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl TimedOperation {
    pub fn start(name: impl Into<String>) -> Self {
        let name = name.into();
        let started_at = chrono::Utc::now();
        info!(operation = %name, started_at = %started_at.to_rfc3339(), "Operation started");
        Self {
            name,
            started: Instant::now(),
            started_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wall-clock time the operation started.
    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn finish(self) {
        info!(operation = %self.name, duration_ms = self.elapsed_ms(), "Operation completed");
    }

    pub fn fail(self, err: &dyn std::fmt::Display) {
        error!(
            operation = %self.name,
            duration_ms = self.elapsed_ms(),
            error = %err,
            "Operation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_names() {
        assert!(is_valid_level("info"));
        assert!(is_valid_level("WARN"));
        assert!(!is_valid_level("verbose"));
        assert!(!is_valid_level(""));
    }

    #[test]
    fn test_timed_operation() {
        let op = TimedOperation::start("create");
        assert_eq!(op.name(), "create");
        assert!(op.started_at() <= chrono::Utc::now());
        op.finish();
    }
}
