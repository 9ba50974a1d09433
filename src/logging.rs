//! Process-wide `tracing` subscriber setup.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive variable; `RUST_LOG` is honored when it is unset.
pub const LOG_ENV: &str = "MEDIA_SYNC_LOG";

/// Prefix of the daily-rolling log file.
const LOG_FILE_PREFIX: &str = "media-sync.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
    /// Also write a daily-rolling file into this directory.
    pub file_dir: Option<PathBuf>,
}

/// Pick the filter directive: `MEDIA_SYNC_LOG`, then `RUST_LOG`, then a
/// default that `--verbose` raises to debug for this crate.
pub fn filter_directive(own: Option<String>, rust_log: Option<String>, verbose: bool) -> String {
    let pick = |value: Option<String>| {
        value
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    pick(own)
        .or_else(|| pick(rust_log))
        .unwrap_or_else(|| {
            if verbose {
                "info,media_sync=debug".to_string()
            } else {
                "info".to_string()
            }
        })
}

fn build_filter(verbose: bool) -> EnvFilter {
    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        verbose,
    );
    EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Ignoring invalid log filter '{}': {}", directive, e);
        EnvFilter::new("info")
    })
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if options.json {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(options.verbose)
                .boxed(),
        );
    }

    let guard = match &options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(options.verbose))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
