//! Structured logging for the function.
//!
//! Lambda ships stdout to CloudWatch, so events are written as single-line JSON
//! without ANSI colouring or a local timestamp (CloudWatch stamps each line).

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global subscriber once per execution environment.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let stage = std::env::var("STAGE").unwrap_or_default();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(&stage, lambda_log_level().as_deref())));

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(false)
                .with_ansi(false)
                .without_time()
                .with_filter(filter),
        );

        // A subscriber may already be installed by a test harness
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }

        tracing::info!(stage = %stage, "structured logging initialized");
    });
}

fn lambda_log_level() -> Option<String> {
    std::env::var("AWS_LAMBDA_LOG_LEVEL")
        .ok()
        .filter(|level| !level.is_empty())
        .map(|level| level.to_lowercase())
}

fn log_level(stage: &str, lambda_level: Option<&str>) -> String {
    if let Some(level) = lambda_level {
        return level.to_string();
    }
    match stage {
        "dev" | "test" => "debug".to_string(),
        _ => "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_follows_stage() {
        assert_eq!(log_level("dev", None), "debug");
        assert_eq!(log_level("production", None), "info");
        assert_eq!(log_level("production", Some("warn")), "warn");
    }
}
