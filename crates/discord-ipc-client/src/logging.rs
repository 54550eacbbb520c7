//! Tracing setup for the `discord-ipc` binary and embedding applications.
//!
//! # Usage
//!
//! ```ignore
//! use discord_ipc_client::logging::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default(), false).expect("failed to initialize logging");
//! ```
//!
//! `RUST_LOG` always wins over the configured level.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target prefix shared by the binary and both library crates.
const DEFAULT_TARGET: &str = "discord_ipc";

/// Errors that can occur during logging initialization.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Failed to set global subscriber.
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    /// Failed to parse the configured level.
    #[error("invalid log level {0:?}")]
    InvalidLevel(String),
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line format (default).
    #[default]
    Compact,
    /// Multi-line human-readable format.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// `[logging]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level applied to this crate's targets when `RUST_LOG` is unset.
    pub level: String,

    /// Output format.
    pub format: LogFormat,

    /// Include file and line in each record.
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Parses the configured level; `debug` forces `DEBUG`.
    pub fn effective_level(&self, debug: bool) -> Result<Level, LoggingError> {
        if debug {
            return Ok(Level::DEBUG);
        }
        self.level
            .parse()
            .map_err(|_| LoggingError::InvalidLevel(self.level.clone()))
    }

    /// Filter directive used when `RUST_LOG` is unset.
    pub fn default_directive(&self, debug: bool) -> Result<String, LoggingError> {
        let level = self.effective_level(debug)?;
        Ok(format!(
            "{}={}",
            DEFAULT_TARGET,
            level.as_str().to_ascii_lowercase()
        ))
    }
}

/// Installs the global subscriber.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
///
/// # Errors
///
/// Returns an error if the level is invalid or a global subscriber is
/// already set.
pub fn init_logging(config: &LoggingConfig, debug: bool) -> Result<(), LoggingError> {
    let directive = config.default_directive(debug)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    match config.format {
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(debug),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}
