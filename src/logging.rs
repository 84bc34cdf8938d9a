//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then the configured level.
pub fn env_filter(logging: &LoggingSection, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = if verbose { "debug" } else { logging.level.as_str() };
    EnvFilter::try_new(directive).with_context(|| format!("Invalid log level '{}'", directive))
}

/// Install the global subscriber. Output goes to stderr so command output on
/// stdout stays clean.
pub fn init(logging: &LoggingSection, verbose: bool) -> Result<()> {
    let filter = env_filter(logging, verbose)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match logging.format {
        LogFormat::Pretty => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!(e)).context("Failed to install tracing subscriber")
}
