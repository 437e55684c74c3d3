//! Outbound TCP link to a device the service dials itself.
//!
//! [`TcpLink`] implements [`Link`] for a pool: requests go out through the
//! write half, and a reader task frames the read half into the pool's
//! [`ResponseSink`].  `reconnect` tears the connection down and dials again,
//! which is what a [`HealthMonitor`] calls when the device goes offline.
//!
//! [`HealthMonitor`]: crate::application::HealthMonitor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use devlink_core::{ChannelDescription, Endpoint, Framing};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::application::{Link, LinkError, ResponseSink};
use crate::infrastructure::network::client::{ClientReceiver, ReceiverRole, READ_CHUNK};

struct Connection {
    write: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

pub struct TcpLink {
    endpoint: Endpoint,
    connect_timeout: Duration,
    framing: Framing,
    sink: Arc<RwLock<Option<ResponseSink>>>,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl TcpLink {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration, framing: Framing) -> Self {
        Self {
            endpoint,
            connect_timeout,
            framing,
            sink: Arc::new(RwLock::new(None)),
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Link to the endpoint of `channel`, using its timeout and framing.
    pub fn for_channel(channel: &ChannelDescription) -> Option<Self> {
        let endpoint = channel.endpoint.clone()?;
        Some(Self::new(endpoint, channel.timeout, channel.framing.clone()))
    }

    /// Routes inbound frames to `sink`, typically the pool using this link.
    pub fn set_response_sink(&self, sink: ResponseSink) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Dials the endpoint, replacing any existing connection.
    ///
    /// # Errors
    ///
    /// [`LinkError::Connect`] if the connection cannot be established within
    /// the connect timeout.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let mut connection = self.connection.lock().await;
        if let Some(old) = connection.take() {
            old.reader.abort();
        }
        self.connected.store(false, Ordering::SeqCst);

        let dial = TcpStream::connect((self.endpoint.host(), self.endpoint.port()));
        let stream = match timeout(self.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_error(e.to_string())),
            Err(_) => {
                return Err(self.connect_error(format!("timed out after {:?}", self.connect_timeout)))
            }
        };
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        let receiver = ClientReceiver::new(ReceiverRole::Client, self.endpoint.clone(), self.framing.clone())
            .map_err(|e| self.connect_error(e.to_string()))?;
        if let Some(sink) = self.sink.read().unwrap_or_else(|e| e.into_inner()).clone() {
            receiver.set_sink(Some(sink));
        }
        let reader = tokio::spawn(read_loop(read, receiver, Arc::clone(&self.connected)));

        *connection = Some(Connection { write, reader });
        self.connected.store(true, Ordering::SeqCst);
        info!("connected to {}", self.endpoint);
        Ok(())
    }

    /// Drops the connection, if any.
    pub async fn disconnect(&self) {
        if let Some(old) = self.connection.lock().await.take() {
            old.reader.abort();
            debug!("disconnected from {}", self.endpoint);
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn connect_error(&self, reason: String) -> LinkError {
        LinkError::Connect {
            endpoint: self.endpoint.clone(),
            reason,
        }
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Link for TcpLink {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut connection = self.connection.lock().await;
        let Some(conn) = connection.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        let result = async {
            conn.write.write_all(bytes).await?;
            conn.write.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("send to {} failed: {e}", self.endpoint);
            self.connected.store(false, Ordering::SeqCst);
            return Err(LinkError::Io(e));
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        self.connect().await
    }
}

async fn read_loop(mut read: OwnedReadHalf, receiver: ClientReceiver, connected: Arc<AtomicBool>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                receiver.process_bytes(&buf[..n]);
            }
            Err(e) => {
                debug!("read from {} failed: {e}", receiver.endpoint());
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    debug!("link to {} lost", receiver.endpoint());
}
