//! # Structured Logging Module
//!
//! Process-wide `tracing` setup plus small helpers that keep the field names
//! of job-level log records consistent across the facade, the workers and the
//! distributed engine.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// `RUST_LOG` wins over `config.level`. If a global subscriber is already
/// installed (an embedding application, a test harness) it is kept.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            level = %config.level,
            json = config.json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

pub fn is_logging_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

/// Log structured data for task, workflow and chunk job operations
pub fn log_job_operation(
    operation: &str,
    task_name: &str,
    job_id: Option<&str>,
    trace_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_name = %task_name,
        job_id = job_id,
        trace_id = trace_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 JOB_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&LoggingConfig {
            level: "debug".to_string(),
            json: true,
        });
        assert!(LOGGER_INITIALIZED.get().is_some());
    }

    #[test]
    fn test_helpers_do_not_require_subscriber() {
        log_job_operation("dispatch", "embed", Some("embed:t:1"), Some("t"), "queued", None);
        log_error("worker", "claim", "broker unavailable", Some("queue=embed"));
    }
}
