//! Client error types.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use discord_ipc_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while talking to the Discord client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No IPC endpoint exists for any candidate slot.
    #[error("could not find a running Discord client")]
    DiscordNotFound,

    /// The resolved endpoint vanished before it could be opened.
    #[error("IPC endpoint does not exist: {}", path.display())]
    InvalidPipe { path: PathBuf },

    /// Opening the transport took longer than the connection timeout.
    #[error("connection timed out after {timeout:?}")]
    ConnectionTimeout { timeout: Duration },

    /// Handshake refused because the client id is unknown.
    #[error("client ID is invalid")]
    InvalidId,

    /// Handshake refused for any other reason.
    #[error("Discord refused the handshake: {message} (code {code})")]
    Discord { code: i64, message: String },

    /// No response arrived within the response timeout.
    #[error("no response within {timeout:?}")]
    ResponseTimeout { timeout: Duration },

    /// The stream was closed, or a header was cut short.
    #[error("IPC pipe closed")]
    PipeClosed,

    /// The remote answered with an `ERROR` event.
    #[error("server error: {message}")]
    Server { message: String },

    /// A frame could not be decoded.
    #[error(transparent)]
    MalformedFrame(ProtocolError),

    /// A body could not be encoded. Indicates a caller bug.
    #[error(transparent)]
    Encode(ProtocolError),

    /// Any other OS-level I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ClientError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// True when the connection is unusable and the caller should reconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::PipeClosed | Self::ResponseTimeout { .. })
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        if err.is_malformed() {
            Self::MalformedFrame(err)
        } else {
            Self::Encode(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_split_by_kind() {
        let malformed: ClientError = ProtocolError::malformed("bad header").into();
        assert!(matches!(malformed, ClientError::MalformedFrame(_)));

        let too_large: ClientError = ProtocolError::FrameTooLarge { size: 1 }.into();
        assert!(matches!(too_large, ClientError::Encode(_)));
    }

    #[test]
    fn display_messages() {
        let err = ClientError::Discord {
            code: 5000,
            message: "Something else".into(),
        };
        assert_eq!(
            err.to_string(),
            "Discord refused the handshake: Something else (code 5000)"
        );
        assert_eq!(ClientError::server("boom").to_string(), "server error: boom");

        let malformed: ClientError = ProtocolError::malformed("bad header").into();
        assert_eq!(malformed.to_string(), "malformed frame: bad header");
    }
}
