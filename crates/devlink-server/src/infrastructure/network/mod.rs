//! Network infrastructure.
//!
//! ```text
//!   ServerServices ──► Listener (tcp | ws | ssl | wss) ──► ClientRegistry ──► Client
//!                          │                                               │    │
//!                          └── Multiplexer (tcp read halves) ◄─────────────┘    │
//!                                                              ClientReceiver ──┘
//!                                                                    │ frames
//!                                                                    ▼
//!                                                            InstructionPool
//! ```
//!
//! - **`multiplexer`** – one task awaiting readiness on every plain-TCP
//!   connection of a listener.
//! - **`client`** – per-connection receiver/sender pair and lifecycle flags.
//! - **`registry`** – the mutex-guarded list of live clients plus the grace
//!   period sweep.
//! - **`listener`** – accept loop, close sweep, and per-variant handshakes.
//! - **`tls`** – rustls server configuration from PEM files.
//! - **`connector`** – outbound [`TcpLink`] with reconnect support.
//! - **`services`** – [`ServerServices`], the four-listener aggregate.

use std::net::SocketAddr;
use std::path::PathBuf;

use devlink_core::FramingError;
use thiserror::Error;

pub mod client;
pub mod connector;
pub mod listener;
pub mod multiplexer;
pub mod registry;
pub mod services;
pub mod tls;

pub use client::{Client, ClientReceiver, ClientSender, ReadSource, ReceiverRole, SocketId};
pub use connector::TcpLink;
pub use listener::{Listener, ListenerConfig, PoolFactory, ServerEvent, ServerKind, TlsSettings};
pub use multiplexer::Multiplexer;
pub use registry::ClientRegistry;
pub use services::{InitReport, PoolSettings, ServerMask, ServerServices};

/// Errors raised while bringing a listener up or admitting a connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} listener requires a certificate and private key")]
    MissingTls(ServerKind),
    #[error("cannot read {path}: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("invalid framing: {0}")]
    Framing(#[from] FramingError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
