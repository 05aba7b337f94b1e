//! Logging setup
//!
//! Application log goes to a rolling file (plus stdout in text mode). Audit
//! entries (`target: "audit"`) are split into their own rolling file so the
//! withdrawal trail survives log-level changes.

use crate::config::AppConfig;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, filter_fn};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Audit events are emitted under this target
pub const AUDIT_TARGET: &str = "audit";

/// Flush guards for the non-blocking writers; hold until exit
pub struct LogGuards {
    _app: WorkerGuard,
    _audit: WorkerGuard,
}

fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

fn audit_file_name(log_file: &str) -> String {
    match log_file.rsplit_once('.') {
        Some((stem, ext)) => format!("{}.audit.{}", stem, ext),
        None => format!("{}.audit", log_file),
    }
}

/// Audit entries only; ignores the env filter
fn audit_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(|meta| meta.target() == AUDIT_TARGET))
}

pub fn init_logging(config: &AppConfig) -> LogGuards {
    let rotation = rotation(&config.rotation);
    let app_appender = RollingFileAppender::new(rotation.clone(), &config.log_dir, &config.log_file);
    let audit_appender =
        RollingFileAppender::new(rotation, &config.log_dir, audit_file_name(&config.log_file));

    let (app_writer, app_guard) = tracing_appender::non_blocking(app_appender);
    let (audit_writer, audit_guard) = tracing_appender::non_blocking(audit_appender);

    // Breaker transitions stay visible even when the app runs at `error`
    let filter_str = format!("{},offramp_saga::circuit_breaker=warn", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    if config.use_json {
        // Stranded-funds alerts are matched on the `alert` field downstream
        let app_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_writer(app_writer)
            .with_ansi(false)
            .with_filter(filter);
        tracing_subscriber::registry()
            .with(app_layer)
            .with(audit_layer(audit_writer))
            .init();
    } else {
        let app_layer = fmt::layer()
            .with_target(false)
            .with_writer(app_writer)
            .with_ansi(false)
            .and_then(fmt::layer().with_target(false).with_ansi(true))
            .with_filter(filter);
        tracing_subscriber::registry()
            .with(app_layer)
            .with(audit_layer(audit_writer))
            .init();
    }

    LogGuards {
        _app: app_guard,
        _audit: audit_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation("daily"), Rotation::DAILY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::NEVER);
    }

    #[test]
    fn test_audit_file_name() {
        assert_eq!(audit_file_name("offramp.log"), "offramp.audit.log");
        assert_eq!(audit_file_name("offramp"), "offramp.audit");
    }
}
