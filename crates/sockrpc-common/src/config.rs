//! Runtime configuration shared by the client and server.
//!
//! Values normally come from an external key/value configuration source;
//! [`RpcConfig::from_properties`] reads the keys that source uses, and the
//! `with_*` builders cover programmatic setup.

use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::error::{Result, RpcError};
use crate::transport::DEFAULT_MAX_READ_LENGTH;

pub const SOCKET_TIMEOUT_KEY: &str = "net.timeout.socket";
pub const POLL_GRANULARITY_KEY: &str = "net.timeout.granularity";
pub const PERSISTENCE_TIMEOUT_KEY: &str = "rpc.persistence.timeout";
pub const MAX_MESSAGE_LENGTH_KEY: &str = "tcpmessagehandler.maxmsglength";
pub const SERVER_HOST_KEY: &str = "rpc.server.host";
pub const SERVER_PORT_KEY: &str = "rpc.server.port";
pub const KEEP_ALIVE_KEY: &str = "rpc.persistence.enabled";

/// Timeouts, limits and listener address for sockrpc.
///
/// # Default Configuration
///
/// - `socket_timeout`: 2 s (handshake and default call timeout)
/// - `poll_granularity`: 500 ms (how often blocked loops look at shutdown)
/// - `persistence_timeout`: 30 s (idle time before a kept-alive connection closes)
/// - `max_message_length`: 2097148 bytes
/// - `server_host`/`server_port`: `127.0.0.1:0` (OS-assigned port)
/// - `keep_alive`: true
///
/// # Example
///
/// ```rust
/// use sockrpc_common::RpcConfig;
/// use std::time::Duration;
///
/// let config = RpcConfig::default()
///     .with_persistence_timeout(Duration::from_secs(5))
///     .with_server_port(46120);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RpcConfig {
    pub socket_timeout: Duration,
    pub poll_granularity: Duration,
    pub persistence_timeout: Duration,
    pub max_message_length: usize,
    pub server_host: String,
    pub server_port: u16,
    /// Whether callers ask servers for persistent connections
    pub keep_alive: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_millis(2000),
            poll_granularity: Duration::from_millis(500),
            persistence_timeout: Duration::from_millis(30000),
            max_message_length: DEFAULT_MAX_READ_LENGTH,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            keep_alive: true,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from string properties, falling back to the
    /// defaults for absent keys. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if a present value does not parse or the
    /// result fails [`validate`](Self::validate).
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = parse_property::<u64>(properties, SOCKET_TIMEOUT_KEY)? {
            config.socket_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_property::<u64>(properties, POLL_GRANULARITY_KEY)? {
            config.poll_granularity = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_property::<u64>(properties, PERSISTENCE_TIMEOUT_KEY)? {
            config.persistence_timeout = Duration::from_millis(ms);
        }
        if let Some(len) = parse_property::<usize>(properties, MAX_MESSAGE_LENGTH_KEY)? {
            config.max_message_length = len;
        }
        if let Some(host) = properties.get(SERVER_HOST_KEY) {
            config.server_host = host.trim().to_string();
        }
        if let Some(port) = parse_property::<u16>(properties, SERVER_PORT_KEY)? {
            config.server_port = port;
        }
        if let Some(keep_alive) = parse_property::<bool>(properties, KEEP_ALIVE_KEY)? {
            config.keep_alive = keep_alive;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_poll_granularity(mut self, granularity: Duration) -> Self {
        self.poll_granularity = granularity;
        self
    }

    pub fn with_persistence_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_timeout = timeout;
        self
    }

    pub fn with_max_message_length(mut self, max: usize) -> Self {
        self.max_message_length = max;
        self
    }

    pub fn with_server_host(mut self, host: impl Into<String>) -> Self {
        self.server_host = host.into();
        self
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.socket_timeout.is_zero() {
            return Err(RpcError::Config("socket timeout must be non-zero".into()));
        }
        if self.poll_granularity.is_zero() {
            return Err(RpcError::Config("poll granularity must be non-zero".into()));
        }
        if self.persistence_timeout.is_zero() {
            return Err(RpcError::Config("persistence timeout must be non-zero".into()));
        }
        if self.max_message_length == 0 || self.max_message_length > i32::MAX as usize {
            return Err(RpcError::Config(format!(
                "max message length must be between 1 and {}",
                i32::MAX
            )));
        }
        if self.server_host.is_empty() {
            return Err(RpcError::Config("server host must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_property<T: std::str::FromStr>(
    properties: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match properties.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RpcError::Config(format!("invalid value '{}' for {}: {}", raw, key, e))),
        None => Ok(None),
    }
}
