//! Tracing subscriber setup.
//!
//! Human-readable output goes to stderr. When a log directory is given, a JSON copy of
//! every event is also written there through a daily rolling, non-blocking appender.
//! `STAGEHAND_LOG` overrides the filter (e.g. `STAGEHAND_LOG=stagehand=trace`).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "STAGEHAND_LOG";

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

fn filter(verbose: bool) -> Result<EnvFilter> {
    match std::env::var(LOG_ENV) {
        Ok(v) if !v.trim().is_empty() => {
            EnvFilter::try_new(v.trim()).with_context(|| format!("Invalid {} directive", LOG_ENV))
        }
        _ => {
            let level = if verbose { "debug" } else { "info" };
            EnvFilter::try_new(format!("stagehand={},warn", level))
                .context("Invalid default log directive")
        }
    }
}

/// Install the global subscriber. Calling it twice is an error from `try_init`.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "stagehand.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(console::Term::stderr().features().colors_supported());

    tracing_subscriber::registry()
        .with(filter(verbose)?)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
