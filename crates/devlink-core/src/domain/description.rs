//! Read-only channel and device descriptions.
//!
//! A *channel* is a configured communication path (transport, addressing,
//! timeouts, framing, reconnect policy).  One or more *devices* are
//! multiplexed onto a channel; each device is the target of instructions and
//! owns the failure threshold that drives its connection-health state.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::endpoint::Endpoint;
use crate::framing::Framing;

/// Default per-instruction timeout when neither channel nor device sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of consecutive failures that marks a device offline.
pub const DEFAULT_DETECTION_THRESHOLD: u32 = 3;

/// Transport carried by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelProtocol {
    Tcp,
    #[serde(rename = "ws")]
    WebSocket,
    Ssl,
    #[serde(rename = "wss")]
    WebSocketSsl,
}

impl ChannelProtocol {
    /// Configuration scheme string (`tcp`, `ws`, `ssl`, `wss`).
    pub fn scheme(self) -> &'static str {
        match self {
            ChannelProtocol::Tcp => "tcp",
            ChannelProtocol::WebSocket => "ws",
            ChannelProtocol::Ssl => "ssl",
            ChannelProtocol::WebSocketSsl => "wss",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, ChannelProtocol::Ssl | ChannelProtocol::WebSocketSsl)
    }

    pub fn is_websocket(self) -> bool {
        matches!(
            self,
            ChannelProtocol::WebSocket | ChannelProtocol::WebSocketSsl
        )
    }
}

impl fmt::Display for ChannelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Exponential back-off applied between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay to wait after the `attempt`-th failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

/// Static description of a logical communication path.
#[derive(Debug, Clone)]
pub struct ChannelDescription {
    pub name: String,
    pub protocol: ChannelProtocol,
    /// Remote endpoint for channels the service dials; `None` for channels
    /// whose devices connect in to a listener.
    pub endpoint: Option<Endpoint>,
    /// Bound on one send/await-response exchange.
    pub timeout: Duration,
    pub framing: Framing,
    pub reconnect: ReconnectPolicy,
}

impl ChannelDescription {
    pub fn new(name: impl Into<String>, protocol: ChannelProtocol) -> Self {
        Self {
            name: name.into(),
            protocol,
            endpoint: None,
            timeout: DEFAULT_TIMEOUT,
            framing: Framing::Raw,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// A device multiplexed onto a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub name: String,
    /// Protocol-level address (unit id, station number, ...) handed to codecs.
    pub address: Option<String>,
    /// Consecutive failures before the device is considered offline.
    pub detection_threshold: u32,
    /// Overrides the channel timeout for this device.
    pub timeout: Option<Duration>,
}

impl DeviceDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            timeout: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_detection_threshold(mut self, threshold: u32) -> Self {
        self.detection_threshold = threshold.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Effective exchange timeout: device override, else the channel's.
    pub fn effective_timeout(&self, channel: &ChannelDescription) -> Duration {
        self.timeout.unwrap_or(channel.timeout)
    }
}
