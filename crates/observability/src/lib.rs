// crates/observability/src/lib.rs
//! Tracing subscriber setup for the vmbackup binaries.
//!
//! The core library only emits `tracing` events. Binaries call
//! [`init_tracing`] once at startup and hold the returned guard until exit
//! so buffered file output is flushed.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};
use vmbackup_core::LoggingConfig;

/// Rolling log files are named `<prefix>.<date>`.
pub const LOG_FILE_PREFIX: &str = "vmbackupd.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Parse an `EnvFilter` directive string such as `info,vmbackup_core=debug`.
pub fn parse_filter(directives: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .with_context(|| format!("Invalid tracing filter '{directives}'"))
}

/// `RUST_LOG` when set, else the configured level.
pub fn build_env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => parse_filter(level),
    }
}

/// Install the global subscriber: stderr (text or JSON) plus an optional
/// daily-rolling file. Fails if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = build_env_filter(&config.level)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    });

    let guard = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_names(true)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Tracing subscriber already installed")?;

    tracing::debug!(
        level = %config.level,
        json = config.json,
        file_dir = ?config.file_dir,
        "Logging initialized"
    );
    Ok(guard)
}
