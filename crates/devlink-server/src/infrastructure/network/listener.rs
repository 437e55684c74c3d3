//! Interactive listeners: plain TCP, WebSocket, TLS, and WebSocket over TLS.
//!
//! A [`Listener`] owns the listening socket, the accept loop, the close
//! sweep, its [`ClientRegistry`], and (for plain TCP) a [`Multiplexer`].
//! The four variants differ only in how an accepted socket is turned into a
//! transport:
//!
//! | kind           | handshake              | receive side          |
//! |----------------|------------------------|-----------------------|
//! | `Tcp`          | none                   | shared multiplexer    |
//! | `WebSocket`    | HTTP upgrade           | task per connection   |
//! | `Ssl`          | TLS                    | task per connection   |
//! | `WebSocketSsl` | TLS, then HTTP upgrade | task per connection   |
//!
//! # Loops
//!
//! - **accept** – waits on `accept()` with a short timeout so the `running`
//!   flag is checked at a fixed interval, and hands every new socket to its
//!   own admission task so a slow handshake never delays the next accept.
//! - **sweep** – every `sweep_interval`, reaps clients that have been closed
//!   for at least `grace_period`, which gives in-flight synchronous
//!   instructions time to complete first.
//!
//! A per-client I/O error only marks that client closed; the sweep reaps it.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use devlink_core::{ChannelProtocol, Endpoint, Framing, SequenceCounter};
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::application::{InstructionPool, Link, StatusChange};
use crate::infrastructure::network::client::{
    BoxedStream, Client, ClientReceiver, ClientSender, EventTap, ReadSource, ReceiverRole,
};
use crate::infrastructure::network::multiplexer::Multiplexer;
use crate::infrastructure::network::registry::ClientRegistry;
use crate::infrastructure::network::{tls, ServerError};

const EVENT_CAPACITY: usize = 256;

/// The closed set of listener variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServerKind {
    Tcp,
    WebSocket,
    Ssl,
    WebSocketSsl,
}

impl ServerKind {
    pub const ALL: [ServerKind; 4] = [
        ServerKind::Tcp,
        ServerKind::WebSocket,
        ServerKind::Ssl,
        ServerKind::WebSocketSsl,
    ];

    /// Position in a four-slot table.
    pub fn index(self) -> usize {
        match self {
            ServerKind::Tcp => 0,
            ServerKind::WebSocket => 1,
            ServerKind::Ssl => 2,
            ServerKind::WebSocketSsl => 3,
        }
    }

    pub fn protocol(self) -> ChannelProtocol {
        match self {
            ServerKind::Tcp => ChannelProtocol::Tcp,
            ServerKind::WebSocket => ChannelProtocol::WebSocket,
            ServerKind::Ssl => ChannelProtocol::Ssl,
            ServerKind::WebSocketSsl => ChannelProtocol::WebSocketSsl,
        }
    }

    pub fn from_protocol(protocol: ChannelProtocol) -> Self {
        match protocol {
            ChannelProtocol::Tcp => ServerKind::Tcp,
            ChannelProtocol::WebSocket => ServerKind::WebSocket,
            ChannelProtocol::Ssl => ServerKind::Ssl,
            ChannelProtocol::WebSocketSsl => ServerKind::WebSocketSsl,
        }
    }

    pub fn is_secure(self) -> bool {
        self.protocol().is_secure()
    }

    /// Plain TCP connections are read through the shared multiplexer.
    pub fn uses_multiplexer(self) -> bool {
        self == ServerKind::Tcp
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol().scheme())
    }
}

/// Lifecycle notifications published by a listener.
///
/// `StatusChanged` carries health transitions of a connection's pool and is
/// published on the [`ServerServices`] stream.
///
/// [`ServerServices`]: crate::infrastructure::network::ServerServices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Accepted { kind: ServerKind, endpoint: Endpoint },
    Closed { kind: ServerKind, endpoint: Endpoint },
    Received { kind: ServerKind, endpoint: Endpoint, frame: Vec<u8> },
    StatusChanged { kind: ServerKind, endpoint: Endpoint, change: StatusChange },
}

impl ServerEvent {
    pub fn kind(&self) -> ServerKind {
        match self {
            ServerEvent::Accepted { kind, .. }
            | ServerEvent::Closed { kind, .. }
            | ServerEvent::Received { kind, .. }
            | ServerEvent::StatusChanged { kind, .. } => *kind,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            ServerEvent::Accepted { endpoint, .. }
            | ServerEvent::Closed { endpoint, .. }
            | ServerEvent::Received { endpoint, .. }
            | ServerEvent::StatusChanged { endpoint, .. } => endpoint,
        }
    }
}

/// PEM files for the secure variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// When set, clients must present a certificate signed by this CA.
    pub ca_cert: Option<PathBuf>,
}

/// Bind parameters and timings for one listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub kind: ServerKind,
    pub bind: SocketAddr,
    pub tls: Option<TlsSettings>,
    /// Default instruction timeout for pools on this listener's connections.
    pub timeout: Duration,
    /// Upper bound on the TLS / WebSocket handshake.
    pub handshake_timeout: Duration,
    /// How long a closed client lingers before it is reaped.
    pub grace_period: Duration,
    pub accept_interval: Duration,
    pub sweep_interval: Duration,
    pub framing: Framing,
}

impl ListenerConfig {
    pub fn new(kind: ServerKind, bind: SocketAddr) -> Self {
        Self {
            kind,
            bind,
            tls: None,
            timeout: devlink_core::DEFAULT_TIMEOUT,
            handshake_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(2),
            accept_interval: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(500),
            framing: Framing::Raw,
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }
}

/// Creates the instruction pool for a newly accepted connection.
pub type PoolFactory = Arc<dyn Fn(&Endpoint, Arc<dyn Link>) -> Option<InstructionPool> + Send + Sync>;

struct ListenerShared {
    config: ListenerConfig,
    running: AtomicBool,
    registry: ClientRegistry,
    mux: Multiplexer,
    events: broadcast::Sender<ServerEvent>,
    pool_factory: Option<PoolFactory>,
    client_ids: SequenceCounter,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One listening socket and everything accepted through it.
///
/// Cheap to clone; all clones refer to the same listener.
#[derive(Clone)]
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    pub fn new(config: ListenerConfig) -> Self {
        Self::build(config, None)
    }

    /// Listener whose connections each get a pool from `factory`.
    pub fn with_pool_factory(config: ListenerConfig, factory: PoolFactory) -> Self {
        Self::build(config, Some(factory))
    }

    fn build(config: ListenerConfig, pool_factory: Option<PoolFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mux = Multiplexer::new(format!("{}@{}", config.kind, config.bind));
        Self {
            shared: Arc::new(ListenerShared {
                config,
                running: AtomicBool::new(false),
                registry: ClientRegistry::new(),
                mux,
                events,
                pool_factory,
                client_ids: SequenceCounter::new(),
                local_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn kind(&self) -> ServerKind {
        self.shared.config.kind
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.shared.config
    }

    pub fn is_open(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.lock_local_addr()
    }

    /// Binds, then starts the accept loop, the sweep loop and (for plain TCP)
    /// the multiplexer.  Calling it on an open listener returns its address.
    ///
    /// # Errors
    ///
    /// [`ServerError::BindFailed`] when the socket cannot be bound, and the
    /// TLS / framing variants when the configuration is unusable.  Nothing is
    /// started on error.
    pub async fn open(&self) -> Result<SocketAddr, ServerError> {
        if let (true, Some(addr)) = (self.is_open(), self.local_addr()) {
            return Ok(addr);
        }
        let config = &self.shared.config;
        config.framing.validate()?;

        let acceptor = if config.kind.is_secure() {
            let settings = config
                .tls
                .as_ref()
                .ok_or(ServerError::MissingTls(config.kind))?;
            Some(tls::build_acceptor(settings)?)
        } else {
            None
        };

        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: config.bind,
                source,
            })?;
        let local = listener.local_addr()?;
        *self.shared.lock_local_addr() = Some(local);
        self.shared.running.store(true, Ordering::SeqCst);

        if config.kind.uses_multiplexer() {
            self.shared.mux.start();
        }
        let accept = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, acceptor));
        let sweep = tokio::spawn(sweep_loop(Arc::clone(&self.shared)));
        self.shared.lock_tasks().extend([accept, sweep]);

        info!("{} listener open on {local}", config.kind);
        Ok(local)
    }

    /// Stops both loops, closes every client and releases its pool, and
    /// stops the multiplexer.  Idempotent.
    pub async fn close(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.shared.lock_tasks().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let clients = self.shared.registry.close_all();
        let count = clients.len();
        join_all(clients.into_iter().map(release)).await;
        self.shared.mux.shutdown().await;
        info!("{} listener closed ({count} client(s) released)", self.kind());
    }

    /// Sends to the client at `endpoint`.  `false` if it is unknown or the
    /// send failed; a failed send closes that client.
    pub async fn send(&self, endpoint: &Endpoint, bytes: &[u8]) -> bool {
        match self.shared.registry.find(endpoint) {
            Some(client) => client.send(bytes).await.is_ok(),
            None => false,
        }
    }

    /// Sends to every open client; `true` only if every send succeeded.
    pub async fn send_all(&self, bytes: &[u8]) -> bool {
        let clients: Vec<Arc<Client>> = self
            .shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|c| !c.is_closed())
            .collect();
        let results = join_all(clients.iter().map(|c| c.send(bytes))).await;
        results.iter().all(Result::is_ok)
    }

    /// Open clients.
    pub fn client_count(&self) -> usize {
        self.shared.registry.open_count()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.shared.registry.contains(endpoint)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.registry.endpoints()
    }

    pub fn get_client_pool(&self, endpoint: &Endpoint) -> Option<InstructionPool> {
        self.shared.registry.get_client_pool(endpoint)
    }

    /// Operator-initiated close of one client.
    pub fn close_client(&self, endpoint: &Endpoint) -> bool {
        self.shared.registry.close_by_endpoint(endpoint)
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.shared.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.kind())
            .field("bind", &self.shared.config.bind)
            .field("open", &self.is_open())
            .field("clients", &self.client_count())
            .finish()
    }
}

impl ListenerShared {
    fn lock_local_addr(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Loops ────────────────────────────────────────────────────────────────────

async fn accept_loop(shared: Arc<ListenerShared>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    let kind = shared.config.kind;
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            debug!("{kind} accept loop stopping");
            break;
        }
        match timeout(shared.config.accept_interval, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("{kind}: connection from {peer}");
                let shared = Arc::clone(&shared);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    admit(shared, stream, peer, acceptor).await;
                });
            }
            Ok(Err(e)) => error!("{kind} accept error: {e}"),
            Err(_) => {}
        }
    }
}

async fn sweep_loop(shared: Arc<ListenerShared>) {
    let mut ticker = interval(shared.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let reaped = shared
            .registry
            .sweep(Instant::now(), shared.config.grace_period);
        for client in reaped {
            release(client).await;
        }
    }
}

/// Final teardown of a reaped client.
async fn release(client: Arc<Client>) {
    if let Some(pool) = client.detach_pool() {
        pool.shutdown().await;
    }
    client.shutdown_sender().await;
    debug!("client {} (socket {}) released", client.endpoint(), client.id());
}

// ── Admission ────────────────────────────────────────────────────────────────

async fn admit(shared: Arc<ListenerShared>, stream: TcpStream, peer: SocketAddr, acceptor: Option<TlsAcceptor>) {
    let kind = shared.config.kind;
    let _ = stream.set_nodelay(true);

    let transport = match timeout(
        shared.config.handshake_timeout,
        handshake(kind, stream, acceptor, &shared.mux),
    )
    .await
    {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            warn!("{kind}: rejecting {peer}: {e}");
            return;
        }
        Err(_) => {
            warn!("{kind}: handshake with {peer} timed out");
            return;
        }
    };
    if !shared.running.load(Ordering::SeqCst) {
        return;
    }

    let endpoint = Endpoint::from(peer);
    let receiver = match ClientReceiver::new(ReceiverRole::Server, endpoint.clone(), shared.config.framing.clone()) {
        Ok(receiver) => receiver.with_events(EventTap {
            kind,
            tx: shared.events.clone(),
        }),
        Err(e) => {
            error!("{kind}: invalid framing: {e}");
            return;
        }
    };
    let (sender, source) = transport;
    let client = Arc::new(Client::new(shared.client_ids.next(), receiver, sender));

    if let Some(factory) = &shared.pool_factory {
        if let Some(pool) = factory(&endpoint, client.link()) {
            client.attach_pool(pool);
        }
    }
    register(&shared, client, source).await;
}

/// Adds an admitted client to the registry and starts reading from it.
///
/// `close()` may have drained the registry between the handshake and the
/// add; a client registered after that is removed again and released.
async fn register(shared: &ListenerShared, client: Arc<Client>, source: ReadSource) -> bool {
    let kind = shared.config.kind;
    if !shared.registry.add(Arc::clone(&client)) {
        warn!("{kind}: socket id {} already registered", client.id());
        release(client).await;
        return false;
    }
    if !shared.running.load(Ordering::SeqCst) {
        debug!("{kind}: listener closed while admitting {}", client.endpoint());
        shared.registry.remove(client.id());
        client.set_close_manually();
        release(client).await;
        return false;
    }
    let _ = shared.events.send(ServerEvent::Accepted {
        kind,
        endpoint: client.endpoint().clone(),
    });
    client.start(source);
    info!("{kind}: accepted {} as socket {}", client.endpoint(), client.id());
    true
}

async fn handshake(
    kind: ServerKind,
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    mux: &Multiplexer,
) -> Result<(ClientSender, ReadSource), ServerError> {
    match kind {
        ServerKind::Tcp => {
            let (read, write) = stream.into_split();
            Ok((
                ClientSender::stream(write),
                ReadSource::Multiplexed {
                    mux: mux.clone(),
                    read,
                },
            ))
        }
        ServerKind::Ssl => {
            let tls = accept_tls(stream, acceptor).await?;
            let (read, write) = tokio::io::split(tls);
            Ok((ClientSender::stream(write), ReadSource::Stream(Box::new(read))))
        }
        ServerKind::WebSocket => upgrade(Box::new(stream)).await,
        ServerKind::WebSocketSsl => {
            let tls = accept_tls(stream, acceptor).await?;
            upgrade(Box::new(tls)).await
        }
    }
}

async fn accept_tls(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>, ServerError> {
    let acceptor = acceptor.ok_or_else(|| ServerError::Tls("no TLS acceptor configured".into()))?;
    acceptor
        .accept(stream)
        .await
        .map_err(|e| ServerError::Handshake(format!("TLS: {e}")))
}

async fn upgrade(stream: BoxedStream) -> Result<(ClientSender, ReadSource), ServerError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServerError::Handshake(format!("WebSocket: {e}")))?;
    let (sink, source) = ws.split();
    Ok((ClientSender::websocket(sink), ReadSource::WebSocket(source)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
