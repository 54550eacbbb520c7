//! Protocol engine for the Discord IPC socket.
//!
//! [`IpcClient`] resolves the endpoint, opens the transport and performs the
//! handshake. A successful handshake yields a [`Connection`], the only type
//! that can send or receive frames.
//!
//! # Routing
//!
//! After the handshake a single reader task owns the read half of the
//! stream. Every inbound frame is decoded once and routed:
//!
//! - `Close` frames end the connection
//! - `Ping` frames are answered with a `Pong` carrying the same body
//! - `cmd == "DISPATCH"` messages go to the event handler
//! - anything else fills an outstanding request, or goes to the event
//!   handler when nothing is outstanding
//!
//! Events reach the handler in arrival order, on the reader task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use discord_ipc_protocol::{
    DISPATCH_COMMAND, Frame, FrameHeader, HEADER_SIZE, Handshake, HandshakeHeader, HandshakeReply,
    Message, Opcode, decode_body, encode_frame,
};

use crate::endpoint::{EndpointResolver, IpcPathResolver};
use crate::error::{ClientError, ClientResult};
use crate::transport::{self, Connector, PlatformConnector, stream_error, write_frame};

/// Default bound on opening the transport.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on waiting for a response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake rejection message reported as [`ClientError::InvalidId`].
const INVALID_CLIENT_ID: &str = "Invalid Client ID";

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<Mutex<BoxedWriter>>;
type ResponseSender = mpsc::UnboundedSender<ClientResult<Message>>;
type PingSender = mpsc::UnboundedSender<Value>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport yet.
    Unconnected,
    /// Transport open, waiting for the handshake reply.
    Handshaking,
    /// Handshake accepted; frames may flow.
    Ready,
    /// Terminal. No frame I/O happens after this.
    Closed,
}

/// Receives inbound frames that are not responses.
///
/// Called on the reader task, so implementations should return quickly.
pub trait EventHandler: Send + Sync {
    /// Handles one event.
    fn on_event(&self, message: Message);
}

impl<F> EventHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_event(&self, message: Message) {
        self(message)
    }
}

/// Connection options.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Endpoint slot (0-9). `None` tries every slot in order.
    pub pipe: Option<u8>,

    /// Bound on opening the transport.
    pub connection_timeout: Duration,

    /// Bound on waiting for each response.
    pub response_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pipe: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl ClientOptions {
    /// Builder: set the endpoint slot.
    pub fn with_pipe(mut self, pipe: u8) -> Self {
        self.pipe = Some(pipe);
        self
    }

    /// Builder: set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Builder: set the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// Connection state shared between a [`Connection`] and its reader task.
#[derive(Debug, Clone)]
struct SharedState(Arc<watch::Sender<ConnectionState>>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(watch::Sender::new(ConnectionState::Unconnected)))
    }

    fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    /// Moves to `next`. Nothing leaves `Closed`.
    fn transition(&self, next: ConnectionState) -> bool {
        self.0.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "connection state changed");
            *state = next;
            true
        })
    }

    async fn closed(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

/// Where an inbound frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Close,
    Ping,
    Response,
    Event,
}

/// Routes decoded frames between the response queue and the event handler.
struct Router {
    /// Responses still owed by the remote.
    outstanding: AtomicUsize,
    handler: RwLock<Option<Weak<dyn EventHandler>>>,
}

impl Router {
    fn with_handler(handler: Option<Weak<dyn EventHandler>>) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            handler: RwLock::new(handler),
        }
    }

    fn expect_response(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Consumes one outstanding response, if any.
    fn take_outstanding(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Control opcodes route on the header alone and never fill an
    /// outstanding response. `payload` is `None` when the body did not decode.
    fn classify(&self, opcode: u32, payload: Option<&Value>) -> Route {
        match Opcode::from_u32(opcode) {
            Some(Opcode::Close) => Route::Close,
            Some(Opcode::Ping) => Route::Ping,
            _ if payload.is_some_and(is_dispatch) => Route::Event,
            _ if self.take_outstanding() => Route::Response,
            _ => Route::Event,
        }
    }

    fn set_handler(&self, handler: Option<Weak<dyn EventHandler>>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    fn emit(&self, message: Message) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);

        match handler {
            Some(handler) => handler.on_event(message),
            None => debug!(evt = ?message.evt(), "no event handler registered, dropping event"),
        }
    }
}

fn is_dispatch(payload: &Value) -> bool {
    payload.get("cmd").and_then(Value::as_str) == Some(DISPATCH_COMMAND)
}

/// Entry point: holds what is needed to connect and handshake.
pub struct IpcClient<C: Connector = PlatformConnector> {
    client_id: String,
    options: ClientOptions,
    resolver: Arc<dyn EndpointResolver>,
    connector: C,
    handler: Option<Weak<dyn EventHandler>>,
}

impl IpcClient<PlatformConnector> {
    /// Creates a client using the platform transport and default endpoint search.
    pub fn new(client_id: impl ToString, options: ClientOptions) -> Self {
        Self::with_connector(client_id, options, PlatformConnector::default())
    }
}

impl<C: Connector> IpcClient<C> {
    /// Creates a client with an explicit connector.
    pub fn with_connector(client_id: impl ToString, options: ClientOptions, connector: C) -> Self {
        Self {
            client_id: client_id.to_string(),
            options,
            resolver: Arc::new(IpcPathResolver::from_env()),
            connector,
            handler: None,
        }
    }

    /// Builder: replace the endpoint resolver.
    pub fn with_resolver(mut self, resolver: impl EndpointResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Builder: install an event handler from the moment the handshake completes.
    ///
    /// Only a weak reference is kept; events are dropped once the last
    /// strong reference goes away.
    pub fn with_event_handler<H: EventHandler + 'static>(mut self, handler: &Arc<H>) -> Self {
        let weak: Weak<H> = Arc::downgrade(handler);
        let handler: Weak<dyn EventHandler> = weak;
        self.handler = Some(handler);
        self
    }

    /// Returns the client id sent in the handshake.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the connection options.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Resolves the endpoint, opens it and performs the handshake.
    ///
    /// # Errors
    ///
    /// - [`ClientError::DiscordNotFound`] if no endpoint exists; nothing is opened
    /// - [`ClientError::InvalidPipe`] / [`ClientError::ConnectionTimeout`] from the transport
    /// - [`ClientError::InvalidId`] / [`ClientError::Discord`] if the handshake is refused
    /// - [`ClientError::PipeClosed`] if the stream ends before the reply
    pub async fn connect(&self) -> ClientResult<Connection> {
        let state = SharedState::new();
        let result = self.handshake(&state).await;
        if let Err(e) = &result {
            debug!(error = %e, "handshake failed");
            state.transition(ConnectionState::Closed);
        }
        result
    }

    async fn handshake(&self, state: &SharedState) -> ClientResult<Connection> {
        let path = self
            .resolver
            .resolve(self.options.pipe)
            .ok_or(ClientError::DiscordNotFound)?;

        state.transition(ConnectionState::Handshaking);
        let stream =
            transport::open(&self.connector, &path, self.options.connection_timeout).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let hello = encode_frame(Opcode::Handshake, &Handshake::new(&self.client_id))?;
        write_frame(&mut writer, &hello).await?;
        debug!(client_id = %self.client_id, path = %path.display(), "handshake sent");

        // The remote answers immediately, so this read carries no timeout.
        let reply = read_handshake_reply(&mut reader).await?;
        let ready = match HandshakeReply::from_payload(reply)? {
            HandshakeReply::Accepted(ready) => ready,
            HandshakeReply::Rejected { message, .. } if message == INVALID_CLIENT_ID => {
                return Err(ClientError::InvalidId);
            }
            HandshakeReply::Rejected { code, message } => {
                return Err(ClientError::Discord { code, message });
            }
        };

        state.transition(ConnectionState::Ready);
        Ok(Connection::start(
            reader,
            Box::new(writer),
            ConnectionParts {
                client_id: self.client_id.clone(),
                path,
                ready,
                state: state.clone(),
                handler: self.handler.clone(),
                response_timeout: self.options.response_timeout,
            },
        ))
    }
}

struct ConnectionParts {
    client_id: String,
    path: PathBuf,
    ready: Message,
    state: SharedState,
    handler: Option<Weak<dyn EventHandler>>,
    response_timeout: Duration,
}

/// A handshaken connection.
///
/// `send` calls are serialized; so are `receive` calls. Dropping the
/// connection stops its reader task.
pub struct Connection {
    client_id: String,
    path: PathBuf,
    ready: Message,
    state: SharedState,
    writer: SharedWriter,
    responses: Mutex<mpsc::UnboundedReceiver<ClientResult<Message>>>,
    router: Arc<Router>,
    reader: JoinHandle<()>,
    ponger: JoinHandle<()>,
    response_timeout: Duration,
}

impl Connection {
    fn start<R>(reader: R, writer: BoxedWriter, parts: ConnectionParts) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::with_handler(parts.handler));
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let (pings_tx, pings_rx) = mpsc::unbounded_channel();

        let ponger = tokio::spawn(run_ponger(
            pings_rx,
            Arc::clone(&writer),
            parts.state.clone(),
        ));
        let reader = tokio::spawn(run_reader(
            reader,
            Arc::clone(&router),
            pings_tx,
            responses_tx,
            parts.state.clone(),
        ));

        Self {
            client_id: parts.client_id,
            path: parts.path,
            ready: parts.ready,
            state: parts.state,
            writer,
            responses: Mutex::new(responses_rx),
            router,
            reader,
            ponger,
            response_timeout: parts.response_timeout,
        }
    }

    /// The handshake reply.
    pub fn ready(&self) -> &Message {
        &self.ready
    }

    /// The endpoint this connection was opened on.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Current state: `Ready` until the transport fails or the remote closes.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        self.state.closed().await;
    }

    /// Registers the event handler, replacing any previous one.
    ///
    /// Only a weak reference is kept.
    pub fn set_event_handler<H: EventHandler + 'static>(&self, handler: &Arc<H>) {
        let weak: Weak<H> = Arc::downgrade(handler);
        let handler: Weak<dyn EventHandler> = weak;
        self.router.set_handler(Some(handler));
    }

    /// Removes the event handler. Later events are dropped.
    pub fn clear_event_handler(&self) {
        self.router.set_handler(None);
    }

    /// Encodes and writes one frame.
    ///
    /// Header and body go out in a single write. Unless the opcode is
    /// `Close` or `Pong`, one response is expected and will be returned by
    /// the next [`receive`](Self::receive).
    ///
    /// # Errors
    ///
    /// - [`ClientError::PipeClosed`] if the connection is closed or the write fails
    /// - [`ClientError::Encode`] if the payload cannot be serialized
    pub async fn send<T>(&self, opcode: impl Into<u32>, payload: &T) -> ClientResult<()>
    where
        T: Serialize + ?Sized,
    {
        let opcode = opcode.into();
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::PipeClosed);
        }

        let frame = encode_frame(opcode, payload)?;
        let expects_reply = Opcode::expects_reply(opcode);

        let mut writer = self.writer.lock().await;
        // Registered before writing so a fast reply is never taken for an event.
        if expects_reply {
            self.router.expect_response();
        }
        if let Err(e) = write_frame(&mut *writer, &frame).await {
            if expects_reply {
                self.router.take_outstanding();
            }
            warn!(error = %e, opcode, "write failed, closing connection");
            self.state.transition(ConnectionState::Closed);
            return Err(e);
        }

        trace!(opcode, length = frame.len() - HEADER_SIZE, "frame sent");
        Ok(())
    }

    /// Waits for the next response with the configured response timeout.
    pub async fn receive(&self) -> ClientResult<Message> {
        self.receive_timeout(self.response_timeout).await
    }

    /// Waits for the next response.
    ///
    /// After a timeout the stream position relative to the remote is unknown;
    /// close and reconnect.
    ///
    /// # Errors
    ///
    /// - [`ClientError::ResponseTimeout`] if nothing arrives in time
    /// - [`ClientError::PipeClosed`] if the stream closed or a header was cut short
    /// - [`ClientError::Server`] if the response is an `ERROR` event
    /// - [`ClientError::MalformedFrame`] if the response could not be decoded
    pub async fn receive_timeout(&self, timeout: Duration) -> ClientResult<Message> {
        let next = tokio::time::timeout(timeout, async {
            self.responses.lock().await.recv().await
        })
        .await;

        let message = match next {
            Ok(Some(result)) => result?,
            Ok(None) => return Err(ClientError::PipeClosed),
            Err(_) => {
                warn!(?timeout, "response timed out");
                return Err(ClientError::ResponseTimeout { timeout });
            }
        };

        if message.is_error() {
            let reason = message.error_message().unwrap_or("unknown error");
            return Err(ClientError::server(reason));
        }
        Ok(message)
    }

    /// Sends a frame and waits for its response.
    pub async fn request<T>(&self, opcode: impl Into<u32>, payload: &T) -> ClientResult<Message>
    where
        T: Serialize + ?Sized,
    {
        self.send(opcode, payload).await?;
        self.receive().await
    }

    /// Sends a best-effort `Close` frame and shuts the transport down.
    pub async fn close(self) -> ClientResult<()> {
        if self.state() != ConnectionState::Closed {
            let goodbye = encode_frame(Opcode::Close, &Handshake::new(&self.client_id))?;
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &goodbye).await {
                debug!(error = %e, "close frame not delivered");
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "transport shutdown failed");
            }
        }

        self.reader.abort();
        self.ponger.abort();
        self.state.transition(ConnectionState::Closed);
        debug!(path = %self.path.display(), "connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.ponger.abort();
        self.state.transition(ConnectionState::Closed);
    }
}

/// Reads exactly `buf.len()` bytes; a short read means the pipe closed.
async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> ClientResult<()>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(stream_error)?;
    Ok(())
}

async fn read_handshake_reply<R>(reader: &mut R) -> ClientResult<Value>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    read_exact(reader, &mut header).await?;
    let header = HandshakeHeader::parse(&header)?;

    let mut body = vec![0u8; header.body_len()?];
    read_exact(reader, &mut body).await?;
    trace!(code = header.code, length = header.length, "handshake reply received");

    Ok(decode_body(&body)?)
}

/// Reads one raw frame. Decoding is left to the caller so a bad body does
/// not lose frame boundaries.
async fn read_frame<R>(reader: &mut R) -> ClientResult<(FrameHeader, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    read_exact(reader, &mut header).await?;

    // Past a bad header the frame boundary is lost, so the stream is done.
    let header = FrameHeader::parse(&header).map_err(unusable_header)?;
    let mut body = vec![0u8; header.body_len().map_err(unusable_header)?];
    read_exact(reader, &mut body).await?;
    Ok((header, body))
}

fn unusable_header(err: discord_ipc_protocol::ProtocolError) -> ClientError {
    warn!(error = %err, "unusable frame header, dropping connection");
    ClientError::PipeClosed
}

/// Reader task: the only consumer of the read half.
///
/// Exits on closure or a transport error; dropping `responses` then wakes any
/// waiting `receive` with `PipeClosed`. Pings are handed to the pong task so
/// this loop never waits on the writer.
async fn run_reader<R>(
    mut reader: R,
    router: Arc<Router>,
    pings: PingSender,
    responses: ResponseSender,
    state: SharedState,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let (header, body) = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(ClientError::PipeClosed) => {
                debug!("pipe closed by remote");
                break;
            }
            Err(e) => {
                error!(error = %e, "failed to read frame");
                if router.take_outstanding() {
                    let _ = responses.send(Err(e));
                }
                break;
            }
        };
        trace!(opcode = header.opcode, length = header.length, "frame received");

        let decoded = Frame::from_parts(header, &body);
        let payload = decoded.as_ref().ok().map(|frame| &frame.payload);

        match router.classify(header.opcode, payload) {
            Route::Close => {
                warn!(
                    code = ?payload.and_then(|p| p.get("code")),
                    message = ?payload.and_then(|p| p.get("message")),
                    "remote closed the connection"
                );
                break;
            }
            Route::Ping => match decoded {
                Ok(frame) => {
                    if pings.send(frame.payload).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping undecodable ping"),
            },
            Route::Response => {
                let result = decoded
                    .and_then(Frame::into_message)
                    .map_err(ClientError::from);
                if responses.send(result).is_err() {
                    break;
                }
            }
            Route::Event => match decoded.and_then(Frame::into_message) {
                Ok(message) => router.emit(message),
                Err(e) => error!(error = %e, opcode = header.opcode, "dropping undecodable frame"),
            },
        }
    }

    state.transition(ConnectionState::Closed);
}

/// Pong task: answers pings in order, holding the writer only while writing.
async fn run_ponger(
    mut pings: mpsc::UnboundedReceiver<Value>,
    writer: SharedWriter,
    state: SharedState,
) {
    while let Some(body) = pings.recv().await {
        if let Err(e) = answer_ping(&writer, &body).await {
            warn!(error = %e, "failed to answer ping, closing connection");
            state.transition(ConnectionState::Closed);
            break;
        }
    }
}

async fn answer_ping(writer: &SharedWriter, body: &Value) -> ClientResult<()> {
    let pong = encode_frame(Opcode::Pong, body)?;
    write_frame(&mut *writer.lock().await, &pong).await
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    use serde_json::{Value, json};
    use tokio::io::DuplexStream;

    const RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

    /// Hands out one in-memory stream.
    struct DuplexConnector {
        stream: StdMutex<Option<DuplexStream>>,
        calls: Arc<AtomicUsize>,
    }

    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _path: &Path) -> io::Result<DuplexStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    struct FixedResolver(Option<PathBuf>);

    impl EndpointResolver for FixedResolver {
        fn resolve(&self, _slot: Option<u8>) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    fn fake_discord() -> (IpcClient<DuplexConnector>, DuplexStream) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let connector = DuplexConnector {
            stream: StdMutex::new(Some(client_side)),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let options = ClientOptions::default().with_response_timeout(RESPONSE_TIMEOUT);
        let client = IpcClient::with_connector("123", options, connector)
            .with_resolver(FixedResolver(Some(PathBuf::from("/run/discord-ipc-0"))));
        (client, server_side)
    }

    async fn read_client_frame(server: &mut DuplexStream) -> Frame {
        let mut header = [0u8; HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        let header = FrameHeader::parse(&header).unwrap();
        let mut body = vec![0u8; header.length as usize];
        server.read_exact(&mut body).await.unwrap();
        Frame::from_parts(header, &body).unwrap()
    }

    async fn write_server_frame(server: &mut DuplexStream, opcode: u32, body: Value) {
        server
            .write_all(&encode_frame(opcode, &body).unwrap())
            .await
            .unwrap();
    }

    async fn handshake_with_reply(server: &mut DuplexStream, reply: Value) -> Frame {
        let hello = read_client_frame(server).await;
        write_server_frame(server, Opcode::Frame.into(), reply).await;
        hello
    }

    async fn connected() -> (Connection, DuplexStream) {
        let (client, mut server) = fake_discord();
        let (conn, _) = tokio::join!(
            client.connect(),
            handshake_with_reply(&mut server, json!({"v": 1, "config": {}}))
        );
        (conn.unwrap(), server)
    }

    fn collecting_handler() -> (
        Arc<impl Fn(Message) + Send + Sync>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(move |message: Message| {
            let _ = tx.send(message);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn handshake_succeeds() {
        let (client, mut server) = fake_discord();
        let (conn, hello) = tokio::join!(
            client.connect(),
            handshake_with_reply(&mut server, json!({"v": 1, "config": {}}))
        );

        assert_eq!(hello.opcode, 0);
        assert_eq!(hello.payload, json!({"v": 1, "client_id": "123"}));

        let conn = conn.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.ready().get("config"), Some(&json!({})));
    }

    #[tokio::test]
    async fn handshake_invalid_client_id() {
        let (client, mut server) = fake_discord();
        let (result, _) = tokio::join!(
            client.connect(),
            handshake_with_reply(
                &mut server,
                json!({"code": 4000, "message": "Invalid Client ID"})
            )
        );
        assert!(matches!(result, Err(ClientError::InvalidId)));
    }

    #[tokio::test]
    async fn handshake_other_rejection() {
        let (client, mut server) = fake_discord();
        let (result, _) = tokio::join!(
            client.connect(),
            handshake_with_reply(
                &mut server,
                json!({"code": 5000, "message": "Something else"})
            )
        );
        match result {
            Err(ClientError::Discord { code, message }) => {
                assert_eq!(code, 5000);
                assert_eq!(message, "Something else");
            }
            other => panic!("expected a Discord error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn handshake_reply_never_completes() {
        let (client, mut server) = fake_discord();
        let (result, _) = tokio::join!(client.connect(), async move {
            read_client_frame(&mut server).await;
            server.write_all(&[1, 0, 0]).await.unwrap();
            drop(server);
        });
        assert!(matches!(result, Err(ClientError::PipeClosed)));
    }

    #[tokio::test]
    async fn no_endpoint_fails_before_opening() {
        let (client, _server) = fake_discord();
        let calls = Arc::clone(&client.connector.calls);
        let client = client.with_resolver(FixedResolver(None));

        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::DiscordNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_slot_resolves_in_empty_runtime_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _server) = fake_discord();
        let calls = Arc::clone(&client.connector.calls);
        let client = client.with_resolver(IpcPathResolver::with_dirs([dir.path()]));

        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::DiscordNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connection_timeout() {
        struct Hang;
        impl Connector for Hang {
            type Stream = DuplexStream;
            async fn connect(&self, _path: &Path) -> io::Result<DuplexStream> {
                std::future::pending().await
            }
        }

        let options =
            ClientOptions::default().with_connection_timeout(Duration::from_millis(50));
        let client = IpcClient::with_connector("123", options, Hang)
            .with_resolver(FixedResolver(Some(PathBuf::from("/run/discord-ipc-0"))));

        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::ConnectionTimeout { .. })));
    }

    #[tokio::test]
    async fn receive_server_error() {
        let (conn, mut server) = connected().await;

        conn.send(Opcode::Frame, &json!({"cmd": "GET_GUILDS", "nonce": "1"}))
            .await
            .unwrap();
        let request = read_client_frame(&mut server).await;
        assert_eq!(request.payload["cmd"], "GET_GUILDS");

        write_server_frame(
            &mut server,
            1,
            json!({"evt": "ERROR", "data": {"message": "boom"}}),
        )
        .await;

        match conn.receive().await {
            Err(ClientError::Server { message }) => assert_eq!(message, "boom"),
            other => panic!("expected a server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn receive_regular_response() {
        let (conn, mut server) = connected().await;

        let subscribe = json!({"cmd": "SUBSCRIBE"});
        let (response, _) = tokio::join!(
            conn.request(Opcode::Frame, &subscribe),
            async {
                read_client_frame(&mut server).await;
                write_server_frame(&mut server, 1, json!({"evt": "READY"})).await;
            }
        );
        assert_eq!(response.unwrap().evt(), Some("READY"));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn truncated_header_is_pipe_closed() {
        let (conn, mut server) = connected().await;

        server.write_all(&[1, 0, 0, 0, 9]).await.unwrap();
        drop(server);

        let result = conn.receive_timeout(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ClientError::PipeClosed)));

        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        let result = conn.send(Opcode::Frame, &json!({})).await;
        assert!(matches!(result, Err(ClientError::PipeClosed)));
    }

    #[tokio::test]
    async fn silent_remote_times_out() {
        let (conn, _server) = connected().await;

        let started = Instant::now();
        let result = conn.receive().await;
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(ClientError::ResponseTimeout { timeout }) if timeout == RESPONSE_TIMEOUT
        ));
        assert!(elapsed >= RESPONSE_TIMEOUT);
        assert!(elapsed < RESPONSE_TIMEOUT + Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn event_between_send_and_response() {
        let (conn, mut server) = connected().await;
        let (handler, mut events) = collecting_handler();
        conn.set_event_handler(&handler);

        conn.send(Opcode::Frame, &json!({"cmd": "GET_CHANNEL", "nonce": "2"}))
            .await
            .unwrap();
        read_client_frame(&mut server).await;
        write_server_frame(
            &mut server,
            1,
            json!({"cmd": "DISPATCH", "evt": "MESSAGE_CREATE", "data": {}}),
        )
        .await;
        write_server_frame(
            &mut server,
            1,
            json!({"cmd": "GET_CHANNEL", "nonce": "2", "evt": null, "data": {"id": "9"}}),
        )
        .await;

        let response = conn.receive().await.unwrap();
        assert_eq!(response.nonce(), Some("2"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.evt(), Some("MESSAGE_CREATE"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsolicited_frames_are_events_in_order() {
        let (client, mut server) = fake_discord();
        let (handler, mut events) = collecting_handler();
        let client = client.with_event_handler(&handler);

        let (conn, _) = tokio::join!(
            client.connect(),
            handshake_with_reply(&mut server, json!({"v": 1, "config": {}}))
        );
        let _conn = conn.unwrap();

        for n in 0..3 {
            write_server_frame(&mut server, 1, json!({"evt": "ACTIVITY_JOIN", "seq": n})).await;
        }
        for n in 0..3 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.get("seq"), Some(&json!(n)));
        }
    }

    #[tokio::test]
    async fn dropped_handler_stops_delivery() {
        let (conn, mut server) = connected().await;
        let (handler, mut events) = collecting_handler();
        conn.set_event_handler(&handler);
        drop(handler);

        write_server_frame(&mut server, 1, json!({"cmd": "DISPATCH", "evt": "X"})).await;
        write_server_frame(&mut server, 2, json!({"code": 1000, "message": "bye"})).await;

        conn.closed().await;
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (_conn, mut server) = connected().await;

        write_server_frame(&mut server, Opcode::Ping.into(), json!({"n": 7})).await;
        let pong = read_client_frame(&mut server).await;

        assert_eq!(pong.opcode, Opcode::Pong.as_u32());
        assert_eq!(pong.payload, json!({"n": 7}));
    }

    #[tokio::test]
    async fn remote_close_ends_connection() {
        let (conn, mut server) = connected().await;

        write_server_frame(
            &mut server,
            Opcode::Close.into(),
            json!({"code": 1000, "message": "bye"}),
        )
        .await;

        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.receive().await, Err(ClientError::PipeClosed)));
    }

    #[tokio::test]
    async fn malformed_response_keeps_stream_usable() {
        let (conn, mut server) = connected().await;

        conn.send(Opcode::Frame, &json!({"cmd": "A"})).await.unwrap();
        read_client_frame(&mut server).await;
        let garbage = b"{oops";
        server
            .write_all(&FrameHeader::new(1, garbage.len() as u32).to_bytes())
            .await
            .unwrap();
        server.write_all(garbage).await.unwrap();
        assert!(matches!(
            conn.receive().await,
            Err(ClientError::MalformedFrame(_))
        ));

        let retry = json!({"cmd": "B"});
        let (response, _) = tokio::join!(conn.request(Opcode::Frame, &retry), async {
            read_client_frame(&mut server).await;
            write_server_frame(&mut server, 1, json!({"cmd": "B"})).await;
        });
        assert_eq!(response.unwrap().cmd(), Some("B"));
    }

    #[tokio::test]
    async fn close_says_goodbye() {
        let (conn, mut server) = connected().await;

        conn.close().await.unwrap();
        let goodbye = read_client_frame(&mut server).await;
        assert_eq!(goodbye.opcode, Opcode::Close.as_u32());
        assert_eq!(goodbye.payload["client_id"], "123");
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let (conn, mut server) = connected().await;
        let big = "x".repeat(32 * 1024);
        let body_a = json!({"cmd": "A", "pad": big});
        let body_b = json!({"cmd": "B", "pad": big});

        let (a, b, frames) = tokio::join!(
            conn.send(Opcode::Frame, &body_a),
            conn.send(Opcode::Frame, &body_b),
            async {
                let first = read_client_frame(&mut server).await;
                let second = read_client_frame(&mut server).await;
                (first, second)
            }
        );
        a.unwrap();
        b.unwrap();

        let mut cmds = vec![
            frames.0.payload["cmd"].clone(),
            frames.1.payload["cmd"].clone(),
        ];
        cmds.sort_by_key(|v| v.to_string());
        assert_eq!(cmds, vec![json!("A"), json!("B")]);
    }

    #[tokio::test]
    async fn ping_between_send_and_response_keeps_the_response() {
        let (conn, mut server) = connected().await;
        let (handler, mut events) = collecting_handler();
        conn.set_event_handler(&handler);

        conn.send(Opcode::Frame, &json!({"cmd": "A", "nonce": "1"}))
            .await
            .unwrap();
        read_client_frame(&mut server).await;
        write_server_frame(&mut server, Opcode::Ping.into(), json!([1])).await;
        write_server_frame(&mut server, 1, json!({"cmd": "A", "nonce": "1"})).await;

        let response = conn.receive().await.unwrap();
        assert_eq!(response.cmd(), Some("A"));

        let pong = read_client_frame(&mut server).await;
        assert_eq!(pong.opcode, Opcode::Pong.as_u32());
        assert_eq!(pong.payload, json!([1]));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn pings_are_answered_while_writer_is_busy() {
        let (conn, mut server) = connected().await;
        let (handler, mut events) = collecting_handler();
        conn.set_event_handler(&handler);

        let busy = conn.writer.lock().await;
        write_server_frame(&mut server, Opcode::Ping.into(), json!({"n": 1})).await;
        write_server_frame(&mut server, 1, json!({"cmd": "DISPATCH", "evt": "X"})).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.evt(), Some("X"));

        drop(busy);
        let pong = read_client_frame(&mut server).await;
        assert_eq!(pong.opcode, Opcode::Pong.as_u32());
        assert_eq!(pong.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn oversized_header_is_pipe_closed() {
        let (conn, mut server) = connected().await;

        conn.send(Opcode::Frame, &json!({"cmd": "A"})).await.unwrap();
        read_client_frame(&mut server).await;
        server
            .write_all(&FrameHeader::new(1, discord_ipc_protocol::MAX_FRAME_SIZE + 1).to_bytes())
            .await
            .unwrap();

        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, ClientError::PipeClosed));
        assert!(err.is_disconnect());

        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn server_error_without_message() {
        let (conn, mut server) = connected().await;

        let body = json!({"cmd": "GET_GUILDS"});
        let (response, _) = tokio::join!(conn.request(Opcode::Frame, &body), async {
            read_client_frame(&mut server).await;
            write_server_frame(&mut server, 1, json!({"evt": "ERROR", "data": {}})).await;
        });
        match response {
            Err(ClientError::Server { message }) => assert_eq!(message, "unknown error"),
            other => panic!("expected a server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn undecodable_event_is_dropped() {
        let (conn, mut server) = connected().await;
        let (handler, mut events) = collecting_handler();
        conn.set_event_handler(&handler);

        let garbage = b"{oops";
        server
            .write_all(&FrameHeader::new(1, garbage.len() as u32).to_bytes())
            .await
            .unwrap();
        server.write_all(garbage).await.unwrap();
        write_server_frame(&mut server, 1, json!({"evt": "AFTER"})).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.evt(), Some("AFTER"));
        assert_eq!(conn.state(), ConnectionState::Ready);

        let ping = json!({"cmd": "PING"});
        let (response, _) = tokio::join!(conn.request(Opcode::Frame, &ping), async {
            read_client_frame(&mut server).await;
            write_server_frame(&mut server, 1, json!({"cmd": "PING"})).await;
        });
        assert_eq!(response.unwrap().cmd(), Some("PING"));
    }

    #[tokio::test]
    async fn handshake_negative_length_is_malformed() {
        let (client, mut server) = fake_discord();
        let (result, _) = tokio::join!(client.connect(), async {
            read_client_frame(&mut server).await;
            let mut header = [0u8; HEADER_SIZE];
            header[..4].copy_from_slice(&1i32.to_le_bytes());
            header[4..].copy_from_slice(&(-5i32).to_le_bytes());
            server.write_all(&header).await.unwrap();
        });
        assert!(matches!(result, Err(ClientError::MalformedFrame(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_over_unix_socket() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("discord-ipc-0")).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; HEADER_SIZE];
            stream.read_exact(&mut header).await.unwrap();
            let header = FrameHeader::parse(&header).unwrap();
            let mut body = vec![0u8; header.length as usize];
            stream.read_exact(&mut body).await.unwrap();

            let reply = encode_frame(Opcode::Frame, &json!({"v": 1, "config": {}})).unwrap();
            stream.write_all(&reply).await.unwrap();
            Frame::from_parts(header, &body).unwrap()
        });

        let client = IpcClient::new(123u64, ClientOptions::default().with_pipe(0))
            .with_resolver(IpcPathResolver::with_dirs([dir.path()]));
        let conn = client.connect().await.unwrap();

        let hello = server.await.unwrap();
        assert_eq!(hello.payload["client_id"], "123");
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.path(), dir.path().join("discord-ipc-0"));
    }
}
