//! WolfMesh Configuration
//!
//! TOML configuration for the control-plane server (`wolfmesh server`,
//! `wolfmesh relay`) and for the client session (`wolfmesh up`).

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Control-plane server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server-wide settings
    #[serde(default)]
    pub server: ServerSection,

    /// Address pool
    pub pool: PoolConfig,

    /// Registration API
    #[serde(default)]
    pub api: ApiConfig,

    /// Rendezvous relay
    #[serde(default)]
    pub relay: RelayConfig,

    /// External data plane (tunnel engine on the server)
    #[serde(default)]
    pub dataplane: DataPlaneConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Standalone relay configuration (`wolfmesh relay`); other sections of
/// a server config file are ignored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayServerConfig {
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Directory holding the peer store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Address pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Mesh range in CIDR notation (e.g. "10.0.0.0/24")
    pub cidr: String,

    /// Addresses never handed out, on top of network and broadcast
    #[serde(default = "default_reserved")]
    pub reserved: Vec<String>,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the registration API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Upper bound on handling one request
    #[serde(default = "default_api_timeout")]
    pub request_timeout_secs: u64,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Rendezvous relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Run the relay alongside the control plane
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UDP bind address
    #[serde(default = "default_relay_address")]
    pub bind_address: String,

    /// Receive loops sharing the socket
    #[serde(default = "default_relay_workers")]
    pub workers: usize,

    /// Session lifetime in seconds without traffic (0 = never expire)
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Interval between relay statistics reports
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Receive buffer size; longer datagrams are truncated by the kernel
    #[serde(default = "default_max_datagram")]
    pub max_datagram: usize,
}

/// Server-side data plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    /// Push accepted peers into the local tunnel engine
    #[serde(default)]
    pub enabled: bool,

    /// Tunnel interface on the server
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Persistent keepalive handed to the engine for each peer
    #[serde(default = "default_server_keepalive")]
    pub keepalive_secs: u16,

    /// The server's own tunnel public key, listed first in every peer list
    #[serde(default)]
    pub server_public_key: Option<String>,

    /// The server's own mesh address (must be reserved in the pool)
    #[serde(default)]
    pub server_address: Option<String>,
}

/// Client session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Session settings
    pub client: ClientSection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Base URL of the control plane (e.g. "http://vpn.example.com:8080")
    pub control_url: String,

    /// Tunnel interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Private key file (created on first run)
    #[serde(default = "default_key_path")]
    pub private_key_file: PathBuf,

    /// Persistent keepalive for each configured peer
    #[serde(default = "default_client_keepalive")]
    pub keepalive_secs: u16,

    /// Local tunnel port (random when unset)
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// The server's tunnel public key (required); the server routes the
    /// whole mesh range
    #[serde(default)]
    pub server_public_key: Option<String>,

    /// Tunnel endpoint (host:port) of the server peer (required)
    #[serde(default)]
    pub server_endpoint: Option<String>,

    /// Timeout for a single registration request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Registration attempts before giving up on retryable errors
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,

    /// Backoff step between registration attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Liveness poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// A peer with no handshake for this long is stale
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,

    /// Time allowed for first handshakes after configuration
    #[serde(default = "default_handshake_grace")]
    pub handshake_grace_secs: u64,

    /// Rendezvous relay (host:port) to announce through
    #[serde(default)]
    pub relay_address: Option<String>,

    /// Relay announce interval
    #[serde(default = "default_relay_announce_interval")]
    pub relay_announce_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmesh")
}

fn default_reserved() -> Vec<String> {
    Vec::new()
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_api_timeout() -> u64 {
    10
}

fn default_relay_address() -> String {
    "0.0.0.0:3478".to_string()
}

fn default_relay_workers() -> usize {
    1
}

fn default_session_ttl() -> u64 {
    120
}

fn default_report_interval() -> u64 {
    60
}

fn default_max_datagram() -> usize {
    2048
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_server_keepalive() -> u16 {
    5
}

fn default_client_keepalive() -> u16 {
    25
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/wolfmesh/private.key")
}

fn default_request_timeout() -> u64 {
    10
}

fn default_register_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    5
}

fn default_liveness_timeout() -> u64 {
    180
}

fn default_handshake_grace() -> u64 {
    30
}

fn default_relay_announce_interval() -> u64 {
    25
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            request_timeout_secs: default_api_timeout(),
            cors_enabled: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_relay_address(),
            workers: default_relay_workers(),
            session_ttl_secs: default_session_ttl(),
            report_interval_secs: default_report_interval(),
            max_datagram: default_max_datagram(),
        }
    }
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: default_interface(),
            keepalive_secs: default_server_keepalive(),
            server_public_key: None,
            server_address: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl RelayConfig {
    /// Session TTL, `None` when sessions never expire
    pub fn session_ttl(&self) -> Option<Duration> {
        match self.session_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Interval between statistics reports
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    /// Validate relay settings
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            return Err(Error::Config("relay.bind_address cannot be empty".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("relay.workers must be at least 1".into()));
        }
        if self.max_datagram < crate::relay::wire::MIN_ANNOUNCE_LEN {
            return Err(Error::Config(format!(
                "relay.max_datagram must be at least {} bytes",
                crate::relay::wire::MIN_ANNOUNCE_LEN
            )));
        }
        Ok(())
    }
}

impl RelayServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayServerConfig = toml::from_str(&content)?;
        config.relay.validate()?;
        Ok(config)
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let cidr = self.pool_cidr()?;
        let reserved = self.reserved_addresses()?;
        for addr in &reserved {
            if !cidr.contains(addr) {
                return Err(Error::Config(format!(
                    "pool.reserved address {} is outside {}",
                    addr, cidr
                )));
            }
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(Error::Config("api.bind_address cannot be empty".into()));
        }

        if self.relay.enabled {
            self.relay.validate()?;
        }

        if self.dataplane.enabled && self.dataplane.interface.is_empty() {
            return Err(Error::Config("dataplane.interface cannot be empty".into()));
        }

        match (self.server_peer()?, self.dataplane.server_address.is_some()) {
            (Some((_, addr)), _) => {
                if !reserved.contains(&addr) {
                    return Err(Error::Config(format!(
                        "dataplane.server_address {} must be listed in pool.reserved",
                        addr
                    )));
                }
            }
            (None, true) => {
                return Err(Error::Config(
                    "dataplane.server_address requires dataplane.server_public_key".into(),
                ));
            }
            (None, false) => {}
        }

        Ok(())
    }

    /// Parse the pool range
    pub fn pool_cidr(&self) -> Result<Ipv4Net> {
        let net: Ipv4Net = self
            .pool
            .cidr
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("pool.cidr '{}': {}", self.pool.cidr, e)))?;
        if net.prefix_len() > 30 {
            return Err(Error::Config(format!(
                "pool.cidr {} leaves no assignable addresses",
                net
            )));
        }
        Ok(net)
    }

    /// Parse the extra reserved addresses
    pub fn reserved_addresses(&self) -> Result<Vec<Ipv4Addr>> {
        self.pool
            .reserved
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<Ipv4Addr>()
                    .map_err(|e| Error::Config(format!("pool.reserved '{}': {}", s, e)))
            })
            .collect()
    }

    /// The server's own peer entry, if configured
    pub fn server_peer(&self) -> Result<Option<(Identity, Ipv4Addr)>> {
        let key = match &self.dataplane.server_public_key {
            Some(k) => k,
            None => return Ok(None),
        };
        let identity = Identity::parse(key)
            .map_err(|e| Error::Config(format!("dataplane.server_public_key: {}", e)))?;
        let addr = match &self.dataplane.server_address {
            Some(a) => a
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| Error::Config(format!("dataplane.server_address '{}': {}", a, e)))?,
            None => {
                return Err(Error::Config(
                    "dataplane.server_public_key requires dataplane.server_address".into(),
                ))
            }
        };
        Ok(Some((identity, addr)))
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.server.data_dir
    }

    /// Path of the SQLite peer store
    pub fn store_path(&self) -> PathBuf {
        self.server.data_dir.join("peers.db")
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let c = &self.client;
        if !(c.control_url.starts_with("http://") || c.control_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "client.control_url '{}' must be an http(s) URL",
                c.control_url
            )));
        }
        if c.interface.is_empty() || c.interface.len() > 15 {
            return Err(Error::Config(
                "client.interface must be 1-15 characters".into(),
            ));
        }
        if c.register_attempts == 0 {
            return Err(Error::Config("client.register_attempts must be at least 1".into()));
        }
        if c.poll_interval_secs == 0 {
            return Err(Error::Config("client.poll_interval_secs must be at least 1".into()));
        }
        // Every other peer is reached through the server, so it must be known
        self.server_identity()?;
        self.server_endpoint()?;
        if c.liveness_timeout_secs <= c.poll_interval_secs {
            return Err(Error::Config(
                "client.liveness_timeout_secs must exceed client.poll_interval_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.client.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.client.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.client.poll_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.client.liveness_timeout_secs)
    }

    pub fn handshake_grace(&self) -> Duration {
        Duration::from_secs(self.client.handshake_grace_secs)
    }

    /// The server's tunnel identity
    pub fn server_identity(&self) -> Result<Identity> {
        let key = self
            .client
            .server_public_key
            .as_deref()
            .ok_or_else(|| Error::Config("client.server_public_key is required".into()))?;
        Identity::parse(key).map_err(|e| Error::Config(format!("client.server_public_key: {}", e)))
    }

    /// The server's outer host:port
    pub fn server_endpoint(&self) -> Result<&str> {
        match self.client.server_endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => Ok(endpoint),
            _ => Err(Error::Config("client.server_endpoint is required".into())),
        }
    }

    pub fn relay_announce_interval(&self) -> Duration {
        Duration::from_secs(self.client.relay_announce_interval_secs.max(1))
    }
}
