//! Shared infrastructure for the JSON exporter.
//!
//! This crate provides the pieces that are not specific to scraping or
//! metrics:
//!
//! - [`watcher`] - Generic hot-reloadable configuration holder
//!   ([`ConfigWatcher`])
//! - [`init_tracing`] - Logging setup

pub mod watcher;

pub use watcher::{ConfigSnapshot, ConfigWatcher, LoadError};

use std::str::FromStr;

use thiserror::Error;

/// Error raised when the tracing subscriber cannot be installed.
#[derive(Debug, Error)]
#[error("failed to initialize tracing: {0}")]
pub struct InitError(String);

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?} (expected \"text\" or \"json\")")),
        }
    }
}

/// Initialize tracing with the given level directive and output format.
///
/// The `RUST_LOG` environment variable takes precedence over `level` when it
/// is set.
///
/// # Example
///
/// ```ignore
/// use json_exporter_common::{LogFormat, init_tracing};
///
/// init_tracing("info", LogFormat::Text)?;
/// ```
pub fn init_tracing(level: &str, format: LogFormat) -> Result<(), InitError> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| InitError(e.to_string()))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| InitError(e.to_string()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
