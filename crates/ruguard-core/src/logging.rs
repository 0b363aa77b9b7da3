//! Structured logging setup.
//!
//! One global `tracing` subscriber writing to stderr, either human-readable
//! or as JSON lines. `RUST_LOG` overrides the configured level, e.g.
//! `RUST_LOG=ruguard_core=debug`.
//!
//! Field names used across the crate:
//! - `group`: resource group name (lower-cased)
//! - `query_id`: per-query id assigned by the governor
//! - `match_type`: `identify` or `watch`
//! - `rows`: row counts for audit persistence
//!
//! Sample SQL is only logged at debug level or below.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LogFormat;

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),
}

/// Parse a level name, case-insensitively.
pub fn parse_level(level: &str) -> Result<Level, LogError> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| LogError::InvalidLevel(level.to_string()))
}

fn format_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer().with_writer(writer).with_target(true).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber. A second call fails with
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    parse_level(&config.level)?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(format_layer(config.format, std::io::stderr))
        .try_init()
        .map_err(|_| LogError::AlreadyInitialized)?;

    tracing::debug!(level = %config.level, format = %config.format, "logging initialized");
    Ok(())
}
