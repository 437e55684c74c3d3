//! Network endpoint value type.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a `host:port` string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("endpoint `{0}` is missing a `:port` suffix")]
    MissingPort(String),
    #[error("endpoint `{0}` has an invalid port")]
    InvalidPort(String),
    #[error("endpoint `{0}` has an empty host")]
    EmptyHost(String),
}

/// An immutable `(address, port)` pair.
///
/// Two endpoints are equal when both the host text and the port match, so
/// `127.0.0.1:80` and `localhost:80` are distinct endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the endpoint as a `SocketAddr` when the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.to_string().parse().ok()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_equality_is_by_value() {
        let a = Endpoint::new("10.0.0.1", 502);
        let b = Endpoint::new("10.0.0.1".to_string(), 502);
        assert_eq!(a, b);
        assert_ne!(a, Endpoint::new("10.0.0.1", 503));
    }

    #[test]
    fn test_endpoint_from_socket_addr_round_trips_through_display() {
        let addr: SocketAddr = "192.168.1.20:8080".parse().unwrap();
        let endpoint = Endpoint::from(addr);
        assert_eq!(endpoint.to_string(), "192.168.1.20:8080");
        assert_eq!(endpoint.socket_addr(), Some(addr));
    }

    #[test]
    fn test_endpoint_parses_hostname_with_port() {
        let endpoint: Endpoint = "plc-07.local:502".parse().unwrap();
        assert_eq!(endpoint.host(), "plc-07.local");
        assert_eq!(endpoint.port(), 502);
        assert_eq!(endpoint.socket_addr(), None);
    }

    #[test]
    fn test_endpoint_ipv6_display_is_bracketed() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let endpoint = Endpoint::from(addr);
        assert_eq!(endpoint.to_string(), "[::1]:9000");
        assert_eq!(endpoint.socket_addr(), Some(addr));
    }

    #[test]
    fn test_endpoint_parse_rejects_missing_or_bad_port() {
        assert_eq!(
            "plc".parse::<Endpoint>(),
            Err(EndpointParseError::MissingPort("plc".to_string()))
        );
        assert_eq!(
            "plc:http".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort("plc:http".to_string()))
        );
        assert_eq!(
            ":80".parse::<Endpoint>(),
            Err(EndpointParseError::EmptyHost(":80".to_string()))
        );
    }
}
