//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/discord-ipc/config.toml` by default:
//!
//! ```toml
//! client_id = "123456789012345678"
//! pipe = 0
//! connection_timeout = 30.0
//! response_timeout = 10.0
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{ClientOptions, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT};
use crate::endpoint::validate_slot;
use crate::error::{ClientError, ClientResult};
use crate::logging::LoggingConfig;

/// Configuration for the Discord IPC client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Application client id sent in the handshake.
    pub client_id: Option<String>,

    /// Endpoint slot (0-9). Unset tries every slot.
    pub pipe: Option<u8>,

    /// Seconds allowed for opening the transport.
    pub connection_timeout: f64,

    /// Seconds allowed for each response.
    pub response_timeout: f64,

    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            pipe: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT.as_secs_f64(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT.as_secs_f64(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default path, or defaults if it does not exist.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parses configuration from TOML text.
    pub fn parse(content: &str) -> ClientResult<Self> {
        toml::from_str(content)
            .map_err(|e| ClientError::config(format!("failed to parse config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("discord-ipc")
    }

    /// Returns the client id, or a configuration error if none is set.
    pub fn require_client_id(&self) -> ClientResult<&str> {
        match self.client_id.as_deref() {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(ClientError::config(format!(
                "no client_id configured; pass --client-id or set it in {}",
                Self::default_path().display()
            ))),
        }
    }

    /// Validates the settings and converts them into [`ClientOptions`].
    pub fn to_options(&self) -> ClientResult<ClientOptions> {
        let mut options = ClientOptions::default()
            .with_connection_timeout(seconds("connection_timeout", self.connection_timeout)?)
            .with_response_timeout(seconds("response_timeout", self.response_timeout)?);
        if let Some(pipe) = self.pipe {
            options = options.with_pipe(validate_slot(pipe)?);
        }
        Ok(options)
    }
}

fn seconds(field: &str, value: f64) -> ClientResult<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ClientError::config(format!(
            "{} must be a positive number of seconds, got {}",
            field, value
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| ClientError::config(format!("{} is out of range: {}", field, e)))
}
