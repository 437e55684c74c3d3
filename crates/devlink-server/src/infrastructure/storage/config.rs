//! TOML configuration for the `devlink-server` binary.
//!
//! ```toml
//! log_level = "info"
//!
//! [pool]
//! capacity = 64
//! default_timeout_ms = 1000
//! detection_threshold = 3
//!
//! [[servers]]
//! scheme = "tcp"          # tcp | ws | ssl | wss
//! host = "0.0.0.0"
//! port = 5020
//!
//! [[servers]]
//! scheme = "wss"
//! port = 5443
//! cert = "server.pem"
//! key = "server.key"
//! framing = { kind = "length_prefixed", width = 2, include_header = false }
//! ```
//!
//! Every field except `servers[N].scheme` and `servers[N].port` has a
//! `#[serde(default = ...)]` helper, and a missing file yields
//! [`AppConfig::default`], so the server starts without any configuration.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devlink_core::{ChannelProtocol, Framing, FramingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::DEFAULT_CAPACITY;
use crate::infrastructure::network::{ListenerConfig, PoolSettings, ServerKind, TlsSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("servers[{index}] ({scheme}) requires both `cert` and `key`")]
    MissingTls { index: usize, scheme: ChannelProtocol },

    #[error("scheme `{0}` is configured more than once")]
    DuplicateScheme(ChannelProtocol),

    #[error("servers[{index}]: `{host}:{port}` is not a valid bind address")]
    InvalidAddress { index: usize, host: String, port: u16 },

    #[error("servers[{index}]: {source}")]
    Framing {
        index: usize,
        #[source]
        source: FramingError,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerEntry>,
}

/// Settings for the pool attached to every accepted connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Instruction timeout for listeners that do not set `timeout_ms`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Consecutive failures before a connected device is marked offline.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: u32,
}

/// One `[[servers]]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEntry {
    pub scheme: ChannelProtocol,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default)]
    pub framing: Framing,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_timeout_ms() -> u64 {
    devlink_core::DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_detection_threshold() -> u32 {
    devlink_core::DEFAULT_DETECTION_THRESHOLD
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_grace_period_ms() -> u64 {
    2000
}
fn default_servers() -> Vec<ServerEntry> {
    vec![ServerEntry::new(ChannelProtocol::Tcp, 5020)]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pool: PoolConfig::default(),
            servers: default_servers(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_timeout_ms: default_timeout_ms(),
            detection_threshold: default_detection_threshold(),
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            capacity: self.capacity.max(1),
            detection_threshold: self.detection_threshold.max(1),
        }
    }
}

impl ServerEntry {
    pub fn new(scheme: ChannelProtocol, port: u16) -> Self {
        Self {
            scheme,
            host: default_host(),
            port,
            enabled: true,
            cert: None,
            key: None,
            ca_cert: None,
            timeout_ms: None,
            grace_period_ms: default_grace_period_ms(),
            framing: Framing::Raw,
        }
    }

    /// Listener settings for this entry; `index` is only used in errors.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`], [`ConfigError::MissingTls`] or
    /// [`ConfigError::Framing`] when the entry cannot describe a listener.
    pub fn to_listener_config(
        &self,
        index: usize,
        pool: &PoolConfig,
    ) -> Result<ListenerConfig, ConfigError> {
        let bind = self.bind_addr(index)?;
        self.framing
            .validate()
            .map_err(|source| ConfigError::Framing { index, source })?;

        let timeout_ms = self.timeout_ms.unwrap_or(pool.default_timeout_ms);
        let mut config = ListenerConfig::new(ServerKind::from_protocol(self.scheme), bind)
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_grace_period(Duration::from_millis(self.grace_period_ms))
            .with_framing(self.framing.clone());

        if self.scheme.is_secure() {
            let (Some(cert), Some(key)) = (&self.cert, &self.key) else {
                return Err(ConfigError::MissingTls {
                    index,
                    scheme: self.scheme,
                });
            };
            config = config.with_tls(TlsSettings {
                cert: cert.clone(),
                key: key.clone(),
                ca_cert: self.ca_cert.clone(),
            });
        }
        Ok(config)
    }

    fn bind_addr(&self, index: usize) -> Result<SocketAddr, ConfigError> {
        let invalid = || ConfigError::InvalidAddress {
            index,
            host: self.host.clone(),
            port: self.port,
        };
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip: std::net::IpAddr = host.parse().map_err(|_| invalid())?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl AppConfig {
    /// Listener settings for every enabled server entry.
    ///
    /// # Errors
    ///
    /// The first entry that fails validation, or
    /// [`ConfigError::DuplicateScheme`] when two enabled entries share a
    /// scheme.
    pub fn listener_configs(&self) -> Result<Vec<ListenerConfig>, ConfigError> {
        let mut seen = HashSet::new();
        let mut configs = Vec::new();
        for (index, entry) in self.servers.iter().enumerate() {
            if !entry.enabled {
                continue;
            }
            if !seen.insert(entry.scheme) {
                return Err(ConfigError::DuplicateScheme(entry.scheme));
            }
            configs.push(entry.to_listener_config(index, &self.pool)?);
        }
        Ok(configs)
    }

    /// Checks the whole file without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listener_configs().map(|_| ())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parses and validates `content`.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML, or any validation error.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Loads `path`, returning `AppConfig::default()` if the file does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found", and
/// the [`parse_config`] errors.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default_serves_plain_tcp() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.pool.capacity, 64);
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].scheme, ChannelProtocol::Tcp);
        assert_eq!(cfg.servers[0].port, 5020);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_config_reads_all_schemes() {
        // Arrange
        let toml_str = r#"
log_level = "debug"

[pool]
capacity = 16

[[servers]]
scheme = "tcp"
port = 5020
timeout_ms = 250

[[servers]]
scheme = "ws"
host = "127.0.0.1"
port = 5080
framing = { kind = "delimited", delimiter = [13, 10] }

[[servers]]
scheme = "wss"
port = 5443
cert = "server.pem"
key = "server.key"
ca_cert = "ca.pem"
"#;

        // Act
        let cfg = parse_config(toml_str).unwrap();
        let listeners = cfg.listener_configs().unwrap();

        // Assert
        assert_eq!(cfg.pool.capacity, 16);
        assert_eq!(cfg.pool.detection_threshold, 3);
        assert_eq!(listeners.len(), 3);
        assert_eq!(listeners[0].kind, ServerKind::Tcp);
        assert_eq!(listeners[0].timeout, Duration::from_millis(250));
        assert_eq!(listeners[1].bind, "127.0.0.1:5080".parse::<SocketAddr>().unwrap());
        assert_eq!(
            listeners[1].framing,
            Framing::Delimited {
                delimiter: vec![13, 10]
            }
        );
        assert_eq!(listeners[2].kind, ServerKind::WebSocketSsl);
        assert_eq!(listeners[2].timeout, Duration::from_millis(1000));
        let tls = listeners[2].tls.as_ref().unwrap();
        assert_eq!(tls.ca_cert, Some(PathBuf::from("ca.pem")));
    }

    #[test]
    fn test_secure_scheme_without_key_is_rejected() {
        let toml_str = r#"
[[servers]]
scheme = "ssl"
port = 5443
cert = "server.pem"
"#;
        match parse_config(toml_str) {
            Err(ConfigError::MissingTls { index, scheme }) => {
                assert_eq!(index, 0);
                assert_eq!(scheme, ChannelProtocol::Ssl);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_enabled_scheme_is_rejected() {
        let toml_str = r#"
[[servers]]
scheme = "tcp"
port = 5020

[[servers]]
scheme = "tcp"
port = 5021
"#;
        assert!(matches!(
            parse_config(toml_str),
            Err(ConfigError::DuplicateScheme(ChannelProtocol::Tcp))
        ));
    }

    #[test]
    fn test_disabled_entries_are_not_listeners() {
        let toml_str = r#"
[[servers]]
scheme = "tcp"
port = 5020

[[servers]]
scheme = "tcp"
port = 5021
enabled = false
"#;
        let cfg = parse_config(toml_str).unwrap();
        assert_eq!(cfg.listener_configs().unwrap().len(), 1);
    }

    #[test]
    fn test_hostname_bind_address_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.servers[0].host = "localhost".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidAddress { index: 0, .. })
        ));
    }

    #[test]
    fn test_invalid_framing_is_rejected() {
        let toml_str = r#"
[[servers]]
scheme = "tcp"
port = 5020
framing = { kind = "length_prefixed", width = 3, include_header = false }
"#;
        assert!(matches!(
            parse_config(toml_str),
            Err(ConfigError::Framing { index: 0, source: FramingError::InvalidWidth(3) })
        ));
    }

    #[test]
    fn test_unknown_scheme_is_a_parse_error() {
        let toml_str = r#"
[[servers]]
scheme = "udp"
port = 5020
"#;
        assert!(matches!(parse_config(toml_str), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/devlink/config.toml");
        assert_eq!(load_config(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_load_config_from_temp_file() {
        // Arrange
        let path = std::env::temp_dir().join(format!("devlink_config_{}.toml", std::process::id()));
        let mut cfg = AppConfig::default();
        cfg.log_level = "trace".to_string();
        cfg.pool.detection_threshold = 5;
        std::fs::write(&path, toml::to_string_pretty(&cfg).unwrap()).unwrap();

        // Act
        let loaded = load_config(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.pool.settings().detection_threshold, 5);

        std::fs::remove_file(&path).ok();
    }
}
