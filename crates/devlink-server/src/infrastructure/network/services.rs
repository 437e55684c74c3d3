//! [`ServerServices`]: up to four listeners behind one addressable service.
//!
//! Listeners are stored in a fixed array indexed by [`ServerKind::index`],
//! never in a dynamic collection.  Selection across kinds uses
//! [`ServerMask`], a bit set over the four kinds.
//!
//! `initialize` opens each configured, requested kind independently: one
//! kind failing to bind does not roll back or prevent the others.  Every
//! accepted connection gets a dedicated-dispatcher [`SenderPool`], so
//! `get_client_pool` is the hand-off point between "who is connected" and
//! "what work is queued for them".

use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use devlink_core::{
    ChannelDescription, DeviceDescription, Endpoint, DEFAULT_DETECTION_THRESHOLD,
};
use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::{
    ContextConsumer, InstructionPool, Link, PoolBuilder, SenderPool, DEFAULT_CAPACITY,
};
use crate::infrastructure::network::listener::{
    Listener, ListenerConfig, PoolFactory, ServerEvent, ServerKind,
};
use crate::infrastructure::network::ServerError;

const EVENT_CAPACITY: usize = 1024;

// ── ServerMask ───────────────────────────────────────────────────────────────

/// Bit set over [`ServerKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServerMask(u8);

impl ServerMask {
    pub const NONE: ServerMask = ServerMask(0);
    pub const TCP: ServerMask = ServerMask(1);
    pub const WEB_SOCKET: ServerMask = ServerMask(1 << 1);
    pub const SSL: ServerMask = ServerMask(1 << 2);
    pub const WEB_SOCKET_SSL: ServerMask = ServerMask(1 << 3);
    pub const PLAIN: ServerMask = ServerMask(Self::TCP.0 | Self::WEB_SOCKET.0);
    pub const SECURE: ServerMask = ServerMask(Self::SSL.0 | Self::WEB_SOCKET_SSL.0);
    pub const WEB: ServerMask = ServerMask(Self::WEB_SOCKET.0 | Self::WEB_SOCKET_SSL.0);
    pub const ALL: ServerMask = ServerMask(0b1111);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, kind: ServerKind) -> bool {
        self.0 & ServerMask::from(kind).0 != 0
    }

    /// The kinds in this mask, in index order.
    pub fn kinds(self) -> impl Iterator<Item = ServerKind> {
        ServerKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl From<ServerKind> for ServerMask {
    fn from(kind: ServerKind) -> Self {
        ServerMask(1 << kind.index())
    }
}

impl BitOr for ServerMask {
    type Output = ServerMask;

    fn bitor(self, rhs: ServerMask) -> ServerMask {
        ServerMask(self.0 | rhs.0)
    }
}

impl BitOr<ServerKind> for ServerMask {
    type Output = ServerMask;

    fn bitor(self, rhs: ServerKind) -> ServerMask {
        self | ServerMask::from(rhs)
    }
}

impl BitOrAssign for ServerMask {
    fn bitor_assign(&mut self, rhs: ServerMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ServerMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.kinds().map(|k| k.to_string()).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

// ── Settings and report ──────────────────────────────────────────────────────

/// Parameters for the pool created for each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub capacity: usize,
    pub detection_threshold: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
        }
    }
}

/// Per-kind outcome of [`ServerServices::initialize`].
#[derive(Debug, Default)]
pub struct InitReport {
    pub started: Vec<(ServerKind, SocketAddr)>,
    pub failed: Vec<(ServerKind, ServerError)>,
    /// Requested kinds with no configuration.
    pub skipped: Vec<ServerKind>,
}

impl InitReport {
    /// `true` when nothing requested failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn started_mask(&self) -> ServerMask {
        self.started
            .iter()
            .fold(ServerMask::NONE, |mask, (kind, _)| mask | *kind)
    }

    pub fn address_of(&self, kind: ServerKind) -> Option<SocketAddr> {
        self.started
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| *addr)
    }
}

// ── ServerServices ───────────────────────────────────────────────────────────

pub struct ServerServices {
    configs: [Option<ListenerConfig>; 4],
    pool_settings: PoolSettings,
    listeners: RwLock<[Option<Listener>; 4]>,
    events: broadcast::Sender<ServerEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ServerServices {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerServices {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            configs: Default::default(),
            pool_settings: PoolSettings::default(),
            listeners: RwLock::new(Default::default()),
            events,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Sets (or replaces) the configuration for `config.kind`.
    pub fn configure(&mut self, config: ListenerConfig) -> &mut Self {
        let index = config.kind.index();
        self.configs[index] = Some(config);
        self
    }

    pub fn with_pool_settings(mut self, settings: PoolSettings) -> Self {
        self.pool_settings = settings;
        self
    }

    /// Kinds that have a configuration.
    pub fn configured_mask(&self) -> ServerMask {
        ServerKind::ALL
            .into_iter()
            .filter(|k| self.configs[k.index()].is_some())
            .fold(ServerMask::NONE, |mask, k| mask | k)
    }

    /// Opens every kind in `mask` that is configured and not already active.
    ///
    /// Each kind succeeds or fails on its own.  `consumer`, when given,
    /// receives the context of every instruction completed on any
    /// connection's pool.
    pub async fn initialize(&self, mask: ServerMask, consumer: Option<ContextConsumer>) -> InitReport {
        let mut report = InitReport::default();

        for kind in mask.kinds() {
            if let Some(active) = self.get_service(kind) {
                if let Some(addr) = active.local_addr() {
                    report.started.push((kind, addr));
                }
                continue;
            }
            let Some(config) = self.configs[kind.index()].clone() else {
                report.skipped.push(kind);
                continue;
            };

            let factory = pool_factory(&config, self.pool_settings, consumer.clone(), self.events.clone());
            let listener = Listener::with_pool_factory(config, factory);
            match listener.open().await {
                Ok(addr) => {
                    self.forward_events(&listener);
                    self.lock_listeners_mut()[kind.index()] = Some(listener);
                    report.started.push((kind, addr));
                }
                Err(e) => {
                    error!("{kind} listener failed to start: {e}");
                    report.failed.push((kind, e));
                }
            }
        }

        info!(
            "services initialised: started [{}], failed {}, skipped {}",
            report.started_mask(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }

    /// The active listener of `kind`.
    pub fn get_service(&self, kind: ServerKind) -> Option<Listener> {
        self.lock_listeners()[kind.index()]
            .as_ref()
            .filter(|l| l.is_open())
            .cloned()
    }

    /// The active listener whose registry holds an open client at `endpoint`.
    pub fn get_service_by_endpoint(&self, endpoint: &Endpoint) -> Option<Listener> {
        self.active(ServerMask::ALL)
            .into_iter()
            .find(|l| l.contains(endpoint))
    }

    /// The pool of the connection at `endpoint`, whichever listener owns it.
    pub fn get_client_pool(&self, endpoint: &Endpoint) -> Option<InstructionPool> {
        self.get_service_by_endpoint(endpoint)?
            .get_client_pool(endpoint)
    }

    /// Sends to one endpoint and waits for the write.
    pub async fn send_sync(&self, endpoint: &Endpoint, bytes: &[u8]) -> bool {
        match self.get_service_by_endpoint(endpoint) {
            Some(listener) => listener.send(endpoint, bytes).await,
            None => {
                warn!("send to unknown endpoint {endpoint}");
                false
            }
        }
    }

    /// Sends to one endpoint on a background task.
    pub fn send_async(&self, endpoint: &Endpoint, bytes: Vec<u8>) -> JoinHandle<bool> {
        let listener = self.get_service_by_endpoint(endpoint);
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            match listener {
                Some(listener) => listener.send(&endpoint, &bytes).await,
                None => false,
            }
        })
    }

    /// Sends to every open client of every active listener in `mask`.
    ///
    /// Waits for all of them; `true` only if at least one listener was
    /// targeted and every send succeeded.
    pub async fn broadcast_sync(&self, mask: ServerMask, bytes: &[u8]) -> bool {
        let targets = self.active(mask);
        if targets.is_empty() {
            return false;
        }
        join_all(targets.iter().map(|l| l.send_all(bytes)))
            .await
            .into_iter()
            .all(|ok| ok)
    }

    pub fn broadcast_async(&self, mask: ServerMask, bytes: Vec<u8>) -> JoinHandle<bool> {
        let targets = self.active(mask);
        tokio::spawn(async move {
            if targets.is_empty() {
                return false;
            }
            join_all(targets.iter().map(|l| l.send_all(&bytes)))
                .await
                .into_iter()
                .all(|ok| ok)
        })
    }

    /// Open clients across the active listeners in `mask`.
    pub fn client_count(&self, mask: ServerMask) -> usize {
        self.active(mask).iter().map(Listener::client_count).sum()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.get_service_by_endpoint(endpoint).is_some()
    }

    pub fn endpoints(&self, mask: ServerMask) -> Vec<Endpoint> {
        self.active(mask)
            .iter()
            .flat_map(Listener::endpoints)
            .collect()
    }

    /// Kinds whose listener is open.
    pub fn active_mask(&self) -> ServerMask {
        self.active(ServerMask::ALL)
            .iter()
            .fold(ServerMask::NONE, |mask, l| mask | l.kind())
    }

    /// Accept, close and receive events from every listener.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Closes every listener.  Idempotent.
    pub async fn close(&self) {
        let forwarders: Vec<JoinHandle<()>> = self.lock_forwarders().drain(..).collect();
        for task in forwarders {
            task.abort();
        }
        let listeners: Vec<Listener> = self
            .lock_listeners_mut()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        join_all(listeners.iter().map(|l| l.close())).await;
        if !listeners.is_empty() {
            info!("services closed ({} listener(s))", listeners.len());
        }
    }

    fn active(&self, mask: ServerMask) -> Vec<Listener> {
        self.lock_listeners()
            .iter()
            .flatten()
            .filter(|l| mask.contains(l.kind()) && l.is_open())
            .cloned()
            .collect()
    }

    fn forward_events(&self, listener: &Listener) {
        let mut rx = listener.subscribe();
        let tx = self.events.clone();
        let kind = listener.kind();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(RecvError::Lagged(n)) => warn!("{kind}: {n} event(s) dropped"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.lock_forwarders().push(task);
    }

    fn lock_listeners(&self) -> RwLockReadGuard<'_, [Option<Listener>; 4]> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners_mut(&self) -> RwLockWriteGuard<'_, [Option<Listener>; 4]> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_forwarders(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.forwarders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ServerServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerServices")
            .field("configured", &self.configured_mask())
            .field("active", &self.active_mask())
            .finish()
    }
}

/// One dedicated-dispatcher pool per accepted connection, named after the
/// listener kind (channel) and the peer endpoint (device).  Its health
/// transitions are published on `events` as [`ServerEvent::StatusChanged`].
fn pool_factory(
    config: &ListenerConfig,
    settings: PoolSettings,
    consumer: Option<ContextConsumer>,
    events: broadcast::Sender<ServerEvent>,
) -> PoolFactory {
    let kind = config.kind;
    let timeout: Duration = config.timeout;
    let framing = config.framing.clone();
    Arc::new(move |endpoint: &Endpoint, link: Arc<dyn Link>| {
        let channel = ChannelDescription::new(kind.to_string(), kind.protocol())
            .with_timeout(timeout)
            .with_framing(framing.clone());
        let device = DeviceDescription::new(endpoint.to_string())
            .with_detection_threshold(settings.detection_threshold);
        let mut builder = PoolBuilder::new(Arc::new(channel), Arc::new(device), link)
            .capacity(settings.capacity);
        if let Some(consumer) = &consumer {
            builder = builder.consumer(Arc::clone(consumer));
        }
        let sender = SenderPool::multi(builder);
        let events = events.clone();
        let endpoint = endpoint.clone();
        sender.on_status_changed(move |change| {
            let _ = events.send(ServerEvent::StatusChanged {
                kind,
                endpoint: endpoint.clone(),
                change: change.clone(),
            });
        });
        Some(sender.pool().clone())
    })
}
