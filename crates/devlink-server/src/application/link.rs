//! The seam between scheduling and transport.

use async_trait::async_trait;
use devlink_core::Endpoint;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: Endpoint, reason: String },
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("this link cannot be re-established from this side")]
    Unsupported,
}

/// A transport a pool can push request bytes through.
///
/// Responses do not come back through this trait: whoever reads the
/// transport hands complete frames to the pool's [`ResponseSink`].
///
/// [`ResponseSink`]: crate::application::ResponseSink
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Link: Send + Sync {
    /// Remote side of the link.
    fn endpoint(&self) -> Endpoint;

    fn is_connected(&self) -> bool;

    async fn send(&self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Tears down and re-establishes the transport.
    async fn reconnect(&self) -> Result<(), LinkError>;
}
