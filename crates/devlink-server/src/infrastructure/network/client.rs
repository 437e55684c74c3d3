//! One accepted (or dialled) connection.
//!
//! A [`Client`] aggregates:
//!
//! - a [`ClientReceiver`] that frames inbound bytes and hands each frame to
//!   the connection's instruction pool,
//! - a [`ClientSender`] wrapping the write half of the transport,
//! - lifecycle flags: `close` (no more I/O), `delete` (eligible for the
//!   sweep), whether each was requested by an operator, and the instant the
//!   close happened.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► receiving ──(EOF / I/O error / close())──► closed ──(sweep)──► deleted ──► reaped
//! ```
//!
//! `delete` is only ever set together with `close`, and the sweep never
//! reaps a client whose receive side is still running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use devlink_core::{Endpoint, FrameBuffer, Framing, FramingError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::application::{InstructionPool, Link, LinkError, ResponseSink};
use crate::infrastructure::network::listener::{ServerEvent, ServerKind};
use crate::infrastructure::network::multiplexer::Multiplexer;

/// Identifier of a connection, unique within its listener.
pub type SocketId = u64;

/// Read chunk size for stream transports.
pub(crate) const READ_CHUNK: usize = 16 * 1024;

/// Any bidirectional byte stream (plain TCP or TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

type WsSink = SplitSink<WebSocketStream<BoxedStream>, Message>;
type WsSource = SplitStream<WebSocketStream<BoxedStream>>;

// ── Receiver ─────────────────────────────────────────────────────────────────

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverRole {
    /// Accepted by one of our listeners.
    Server,
    /// Dialled by us.
    Client,
}

/// Where a server-side receiver publishes lifecycle events.
#[derive(Clone)]
pub(crate) struct EventTap {
    pub(crate) kind: ServerKind,
    pub(crate) tx: broadcast::Sender<ServerEvent>,
}

/// Frames inbound bytes and routes each frame to the owning pool.
pub struct ClientReceiver {
    role: ReceiverRole,
    endpoint: Endpoint,
    framer: Mutex<FrameBuffer>,
    sink: RwLock<Option<ResponseSink>>,
    events: Option<EventTap>,
}

impl ClientReceiver {
    pub fn new(role: ReceiverRole, endpoint: Endpoint, framing: Framing) -> Result<Self, FramingError> {
        Ok(Self {
            role,
            endpoint,
            framer: Mutex::new(FrameBuffer::new(framing)?),
            sink: RwLock::new(None),
            events: None,
        })
    }

    pub(crate) fn with_events(mut self, tap: EventTap) -> Self {
        self.events = Some(tap);
        self
    }

    pub fn role(&self) -> ReceiverRole {
        self.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Routes completed frames to `sink`; `None` detaches.
    pub fn set_sink(&self, sink: Option<ResponseSink>) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    /// Feeds a chunk of stream bytes through the framer.  Returns the number
    /// of complete frames it produced.
    pub fn process_bytes(&self, bytes: &[u8]) -> usize {
        let pushed = self.framer.lock().unwrap_or_else(|e| e.into_inner()).push(bytes);
        if let Some(e) = pushed.overflow {
            warn!("{:?} receiver {}: {e}; partial frame discarded", self.role, self.endpoint);
        }
        let frames = pushed.frames;
        let count = frames.len();
        for frame in frames {
            self.process_frame(frame);
        }
        count
    }

    /// Delivers one already-delimited frame (WebSocket messages).
    pub fn process_frame(&self, frame: Vec<u8>) {
        if let Some(tap) = &self.events {
            // No subscribers is fine.
            let _ = tap.tx.send(ServerEvent::Received {
                kind: tap.kind,
                endpoint: self.endpoint.clone(),
                frame: frame.clone(),
            });
        }
        let sink = self.sink.read().unwrap_or_else(|e| e.into_inner()).clone();
        match sink {
            Some(sink) => {
                sink.deliver(frame);
            }
            None => debug!(
                "{:?} receiver {}: {} byte frame with no pool attached",
                self.role,
                self.endpoint,
                frame.len()
            ),
        }
    }

    pub(crate) fn emit(&self, event: impl FnOnce(ServerKind) -> ServerEvent) {
        if let Some(tap) = &self.events {
            let _ = tap.tx.send(event(tap.kind));
        }
    }
}

// ── Sender ───────────────────────────────────────────────────────────────────

/// Write side of a connection.
pub enum ClientSender {
    Stream(tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>),
    WebSocket(tokio::sync::Mutex<WsSink>),
}

impl ClientSender {
    pub fn stream(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        ClientSender::Stream(tokio::sync::Mutex::new(Box::new(writer)))
    }

    pub(crate) fn websocket(sink: WsSink) -> Self {
        ClientSender::WebSocket(tokio::sync::Mutex::new(sink))
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        match self {
            ClientSender::Stream(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(bytes).await?;
                writer.flush().await?;
                Ok(())
            }
            ClientSender::WebSocket(sink) => sink
                .lock()
                .await
                .send(Message::Binary(bytes.to_vec()))
                .await
                .map_err(|e| LinkError::WebSocket(e.to_string())),
        }
    }

    /// Best-effort orderly shutdown of the write side.
    pub async fn shutdown(&self) {
        match self {
            ClientSender::Stream(writer) => {
                let _ = writer.lock().await.shutdown().await;
            }
            ClientSender::WebSocket(sink) => {
                let _ = sink.lock().await.close().await;
            }
        }
    }
}

/// Read side handed to [`Client::start`].
pub enum ReadSource {
    /// Plain TCP: readiness is awaited by the listener's multiplexer.
    Multiplexed {
        mux: Multiplexer,
        read: OwnedReadHalf,
    },
    /// Any other byte stream, read by a dedicated task.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    /// WebSocket messages, read by a dedicated task.
    WebSocket(WsSource),
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct Client {
    id: SocketId,
    endpoint: Endpoint,
    receiver: ClientReceiver,
    sender: ClientSender,
    close_flag: AtomicBool,
    delete_flag: AtomicBool,
    closed_manually: AtomicBool,
    deleted_manually: AtomicBool,
    receiving: AtomicBool,
    deletion_start: Mutex<Option<Instant>>,
    pool: RwLock<Option<InstructionPool>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    mux: Mutex<Option<Multiplexer>>,
}

impl Client {
    pub fn new(id: SocketId, receiver: ClientReceiver, sender: ClientSender) -> Self {
        Self {
            id,
            endpoint: receiver.endpoint().clone(),
            receiver,
            sender,
            close_flag: AtomicBool::new(false),
            delete_flag: AtomicBool::new(false),
            closed_manually: AtomicBool::new(false),
            deleted_manually: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            deletion_start: Mutex::new(None),
            pool: RwLock::new(None),
            reader: Mutex::new(None),
            mux: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn receiver(&self) -> &ClientReceiver {
        &self.receiver
    }

    /// Begins receiving from `source`.
    pub fn start(self: &Arc<Self>, source: ReadSource) {
        if self.is_closed() {
            return;
        }
        self.receiving.store(true, Ordering::SeqCst);
        match source {
            ReadSource::Multiplexed { mux, read } => {
                *self.lock_mux() = Some(mux.clone());
                if !mux.add_client(Arc::clone(self), read) {
                    warn!("client {}: socket id {} already registered", self.endpoint, self.id);
                    self.finish_receiving();
                }
            }
            ReadSource::Stream(read) => {
                let task = tokio::spawn(read_stream(Arc::clone(self), read));
                *self.lock_reader() = Some(task);
            }
            ReadSource::WebSocket(read) => {
                let task = tokio::spawn(read_websocket(Arc::clone(self), read));
                *self.lock_reader() = Some(task);
            }
        }
    }

    /// Hands received bytes to the receiver.
    pub fn process_received_buffer(&self, bytes: &[u8]) -> usize {
        self.receiver.process_bytes(bytes)
    }

    /// The receive side has ended (EOF or error): stop and close.
    pub(crate) fn finish_receiving(&self) {
        self.receiving.store(false, Ordering::SeqCst);
        self.close();
    }

    /// Marks the client closed and stops receiving.  Idempotent.
    pub fn close(&self) {
        if self.close_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.lock_deletion_start() = Some(Instant::now());

        let mux = self.lock_mux().take();
        if let Some(mux) = mux {
            mux.remove_client(self.id);
        }
        let reader = self.lock_reader().take();
        if let Some(task) = reader {
            task.abort();
        }
        self.receiving.store(false, Ordering::SeqCst);

        debug!("client {} (socket {}): closed", self.endpoint, self.id);
        self.receiver.emit(|kind| ServerEvent::Closed {
            kind,
            endpoint: self.endpoint.clone(),
        });
    }

    /// Operator-initiated close.
    pub fn set_close_manually(&self) {
        self.closed_manually.store(true, Ordering::SeqCst);
        self.close();
    }

    /// Operator-initiated delete; implies close.
    pub fn set_delete_manually(&self) {
        self.deleted_manually.store(true, Ordering::SeqCst);
        self.mark_for_deletion();
    }

    /// Flags the client for the sweep; implies close.
    pub fn mark_for_deletion(&self) {
        self.close();
        self.delete_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.close_flag.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_flag.load(Ordering::SeqCst)
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    pub fn closed_manually(&self) -> bool {
        self.closed_manually.load(Ordering::SeqCst)
    }

    pub fn deleted_manually(&self) -> bool {
        self.deleted_manually.load(Ordering::SeqCst)
    }

    /// Time since the client was closed, if it has been.
    pub fn closed_for(&self, now: Instant) -> Option<Duration> {
        self.lock_deletion_start()
            .map(|start| now.saturating_duration_since(start))
    }

    /// Sends `bytes`.  An I/O failure closes the client.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::NotConnected);
        }
        let result = self.sender.send(bytes).await;
        if let Err(e) = &result {
            warn!("client {}: send failed: {e}", self.endpoint);
            self.close();
        }
        result
    }

    pub(crate) async fn shutdown_sender(&self) {
        self.sender.shutdown().await;
    }

    /// Link that pools use to reach this client without keeping it alive.
    pub fn link(self: &Arc<Self>) -> Arc<dyn Link> {
        Arc::new(ClientLink {
            client: Arc::downgrade(self),
            endpoint: self.endpoint.clone(),
        })
    }

    /// Makes `pool` the target of every inbound frame.
    pub fn attach_pool(&self, pool: InstructionPool) {
        self.receiver.set_sink(Some(pool.response_sink()));
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(pool);
    }

    pub fn detach_pool(&self) -> Option<InstructionPool> {
        self.receiver.set_sink(None);
        self.pool.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn pool(&self) -> Option<InstructionPool> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_deletion_start(&self) -> MutexGuard<'_, Option<Instant>> {
        self.deletion_start.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_mux(&self) -> MutexGuard<'_, Option<Multiplexer>> {
        self.mux.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .field("deleted", &self.is_deleted())
            .field("receiving", &self.is_receiving())
            .finish()
    }
}

async fn read_stream(client: Arc<Client>, mut read: Box<dyn AsyncRead + Send + Unpin>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                client.process_received_buffer(&buf[..n]);
            }
            Err(e) => {
                debug!("client {}: read error: {e}", client.endpoint);
                break;
            }
        }
    }
    client.finish_receiving();
}

async fn read_websocket(client: Arc<Client>, mut read: WsSource) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(bytes)) => client.receiver.process_frame(bytes),
            Ok(Message::Text(text)) => client.receiver.process_frame(text.into_bytes()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("client {}: websocket error: {e}", client.endpoint);
                break;
            }
        }
    }
    client.finish_receiving();
}

/// [`Link`] over an accepted client, held weakly.
struct ClientLink {
    client: Weak<Client>,
    endpoint: Endpoint,
}

#[async_trait]
impl Link for ClientLink {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn is_connected(&self) -> bool {
        self.client.upgrade().is_some_and(|c| !c.is_closed())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        match self.client.upgrade() {
            Some(client) => client.send(bytes).await,
            None => Err(LinkError::NotConnected),
        }
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        Err(LinkError::Unsupported)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(framing: Framing) -> (Arc<Client>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let receiver =
            ClientReceiver::new(ReceiverRole::Server, Endpoint::new("127.0.0.1", 40001), framing)
                .unwrap();
        let client = Arc::new(Client::new(7, receiver, ClientSender::stream(ours)));
        (client, theirs)
    }

    #[test]
    fn test_delete_implies_close() {
        let (client, _peer) = client_with(Framing::Raw);
        client.set_delete_manually();
        assert!(client.is_deleted());
        assert!(client.is_closed());
        assert!(client.deleted_manually());
        assert!(client.closed_for(Instant::now()).is_some());
    }

    #[test]
    fn test_close_is_idempotent_and_keeps_first_timestamp() {
        let (client, _peer) = client_with(Framing::Raw);
        client.close();
        let first = client.closed_for(Instant::now()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        client.set_close_manually();
        assert!(client.closed_for(Instant::now()).unwrap() > first);
        assert!(client.closed_manually());
        assert!(!client.is_deleted());
    }

    #[tokio::test]
    async fn test_receiver_frames_bytes_and_publishes_received_events() {
        // Arrange: a delimited receiver with an event tap and no pool.
        let receiver = ClientReceiver::new(
            ReceiverRole::Client,
            Endpoint::new("10.0.0.2", 502),
            Framing::Delimited {
                delimiter: b"\n".to_vec(),
            },
        )
        .unwrap();
        let (tx, mut events) = broadcast::channel(8);
        let receiver = receiver.with_events(EventTap {
            kind: ServerKind::Tcp,
            tx,
        });

        // Act
        assert_eq!(receiver.process_bytes(b"one\ntw"), 1);
        assert_eq!(receiver.process_bytes(b"o\n"), 1);

        // Assert
        match events.recv().await.unwrap() {
            ServerEvent::Received { frame, .. } => assert_eq!(frame, b"one".to_vec()),
            other => panic!("unexpected event {other:?}"),
        }
        match events.recv().await.unwrap() {
            ServerEvent::Received { frame, .. } => assert_eq!(frame, b"two".to_vec()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_client_closes_on_peer_eof() {
        let (client, _peer) = client_with(Framing::Raw);
        client.start(ReadSource::Stream(Box::new(tokio::io::empty())));

        for _ in 0..50 {
            if client.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(client.is_closed());
        assert!(!client.is_receiving());
    }

    #[tokio::test]
    async fn test_send_on_closed_client_fails_without_io() {
        let (client, _peer) = client_with(Framing::Raw);
        client.close();
        assert!(matches!(
            client.send(b"x").await,
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_link_is_disconnected_once_client_dropped() {
        let (client, _peer) = client_with(Framing::Raw);
        let link = client.link();
        assert!(link.is_connected());
        drop(client);
        assert!(!link.is_connected());
        assert!(link.send(b"x").await.is_err());
    }
}
