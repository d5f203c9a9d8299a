//! Tracing subscriber setup for the orchestrator binary.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSection};

const LOG_FILE_PREFIX: &str = "fanout.log";

/// Pick the filter directive: `RUST_LOG` when set and non-empty, else the configured level.
fn filter_directive(configured: &str, env: Option<String>) -> String {
    match env {
        Some(v) if !v.trim().is_empty() => v,
        _ => configured.to_string(),
    }
}

/// Install the global subscriber.
///
/// Console output goes to stderr so `fanout hook` and `fanout config show`
/// keep stdout clean. When `directory` is set a daily rolling JSON file is
/// written as well; the returned guard must be held until exit to flush it.
pub fn init(config: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(&config.level, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
    });

    let guard = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
            layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins_over_config() {
        assert_eq!(
            filter_directive("info", Some("fanout=debug".to_string())),
            "fanout=debug"
        );
        assert_eq!(filter_directive("warn", None), "warn");
        assert_eq!(filter_directive("warn", Some("  ".to_string())), "warn");
    }

    #[test]
    fn test_configured_levels_parse() {
        for level in ["info", "debug", "fanout=trace,tower_http=warn"] {
            assert!(EnvFilter::try_new(level).is_ok(), "{}", level);
        }
    }
}
