//! Tracing setup for the binary.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogSection;

const LOG_FILE_PREFIX: &str = "dockhand.log";

/// Keeps the file writer flushing. Hold it until the process exits.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// `RUST_LOG` wins over the configured level.
pub fn env_filter(rust_log: Option<&str>, configured: &str) -> Result<EnvFilter> {
    match rust_log.filter(|s| !s.trim().is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid RUST_LOG: {}", directives)),
        None => EnvFilter::try_new(configured)
            .with_context(|| format!("Invalid log level: {}", configured)),
    }
}

/// Install the global subscriber: stderr always, plus a daily rolling file
/// when `config.dir` is set. JSON formatting applies to both.
pub fn init(config: &LogSection) -> Result<LogGuard> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = env_filter(rust_log.as_deref(), &config.level)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    });

    let mut file_guard = None;
    if let Some(dir) = &config.dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        layers.push(if config.json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_writer(writer).with_ansi(false).boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: file_guard })
}
