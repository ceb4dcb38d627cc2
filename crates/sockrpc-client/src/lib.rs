//! sockrpc Client
//!
//! Calling side of sockrpc. [`ClientConnection`] is a single handshaken
//! connection; [`ConnectionCache`] keeps persistent connections per
//! destination and is what most callers use.
//!
//! The free functions in this module operate on a process-wide cache,
//! created on first use.

pub mod cache;
pub mod connection;

pub use cache::ConnectionCache;
pub use connection::{ClientConnection, ConnectOptions, ConnectionState, Destination};

use sockrpc_common::protocol::error::{Result, RpcError};
use sockrpc_common::protocol::{RpcArgs, RpcValue};
use sockrpc_common::RpcConfig;
use std::sync::OnceLock;
use std::time::Duration;

static GLOBAL: OnceLock<ConnectionCache> = OnceLock::new();

/// Installs the configuration used by the process-wide cache.
///
/// Must run inside a tokio runtime, before the first call to [`invoke`].
/// Fails if the cache already exists.
pub fn init_global(config: RpcConfig) -> Result<()> {
    config.validate()?;
    let mut installed = false;
    GLOBAL.get_or_init(|| {
        installed = true;
        ConnectionCache::new(config)
    });
    if installed {
        Ok(())
    } else {
        Err(RpcError::Config(
            "global connection cache is already initialized".into(),
        ))
    }
}

/// The process-wide cache, created with the default configuration if
/// [`init_global`] was never called.
pub fn global() -> &'static ConnectionCache {
    GLOBAL.get_or_init(|| ConnectionCache::new(RpcConfig::default()))
}

/// Calls `service.method(args)` on `host:port` through the process-wide cache.
pub async fn invoke(
    host: &str,
    port: u16,
    service: &str,
    method: &str,
    args: RpcArgs,
    timeout: Option<Duration>,
) -> Result<RpcValue> {
    global()
        .invoke(host, port, service, method, args, timeout)
        .await
}

/// Describes the process-wide cache's persistent connections.
pub async fn dump_state() -> String {
    global().dump_state().await
}
