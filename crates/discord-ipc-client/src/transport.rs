//! Platform-specific byte-stream transports.
//!
//! - Unix: Unix domain socket
//! - Windows: named pipe client
//!
//! The engine only sees the [`Connector`] capability; which implementation
//! backs [`PlatformConnector`] is decided at build time.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Opens a bidirectional byte stream to a local endpoint.
pub trait Connector: Send + Sync + 'static {
    /// Connected stream type.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connects to `path`. Must not apply its own timeout.
    fn connect(&self, path: &Path) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use tokio::net::UnixStream;

    /// Connects over a Unix domain socket.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UnixConnector;

    impl Connector for UnixConnector {
        type Stream = UnixStream;

        async fn connect(&self, path: &Path) -> io::Result<UnixStream> {
            UnixStream::connect(path).await
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient};

    /// `ERROR_PIPE_BUSY`: every server instance is taken.
    const ERROR_PIPE_BUSY: i32 = 231;

    /// Delay between attempts while the pipe is busy.
    const PIPE_BUSY_RETRY: Duration = Duration::from_millis(50);

    /// Connects to a named pipe, waiting while all instances are busy.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NamedPipeConnector;

    impl Connector for NamedPipeConnector {
        type Stream = NamedPipeClient;

        async fn connect(&self, path: &Path) -> io::Result<NamedPipeClient> {
            loop {
                match ClientOptions::new().open(path) {
                    Ok(client) => return Ok(client),
                    Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(PIPE_BUSY_RETRY).await;
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::UnixConnector;

#[cfg(windows)]
pub use windows_impl::NamedPipeConnector;

/// Connector for the current platform.
#[cfg(unix)]
pub type PlatformConnector = UnixConnector;

/// Connector for the current platform.
#[cfg(windows)]
pub type PlatformConnector = NamedPipeConnector;

/// Opens `path` with `connector`, bounded by `timeout`.
///
/// # Errors
///
/// - [`ClientError::ConnectionTimeout`] if the timer fires first
/// - [`ClientError::InvalidPipe`] if the endpoint does not exist
/// - [`ClientError::Io`] for any other OS error
pub async fn open<C: Connector>(
    connector: &C,
    path: &Path,
    timeout: Duration,
) -> ClientResult<C::Stream> {
    debug!(path = %path.display(), ?timeout, "opening IPC transport");

    match tokio::time::timeout(timeout, connector.connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => Err(ClientError::InvalidPipe {
            path: path.to_path_buf(),
        }),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ClientError::ConnectionTimeout { timeout }),
    }
}

/// Writes a complete encoded frame and flushes it.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> ClientResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await.map_err(stream_error)?;
    writer.flush().await.map_err(stream_error)
}

/// Maps stream I/O failures: anything that means "the peer is gone" is `PipeClosed`.
pub(crate) fn stream_error(err: io::Error) -> ClientError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => ClientError::PipeClosed,
        _ => ClientError::Io(err),
    }
}
