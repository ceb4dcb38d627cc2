use crate::connection::{ClientConnection, ConnectOptions, Destination};
use sockrpc_common::protocol::error::{Result, RpcError};
use sockrpc_common::protocol::{RpcArgs, RpcValue};
use sockrpc_common::RpcConfig;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A cached persistent connection and the time it last completed a call.
struct CachedEntry {
    connection: Arc<ClientConnection>,
    last_used_at: Instant,
}

struct CacheInner {
    entries: Mutex<HashMap<Destination, CachedEntry>>,
    config: RpcConfig,
    shutdown: CancellationToken,
}

/// Keyed cache of persistent connections, and the entry point for calls.
///
/// # Architecture
///
/// - One connection per `(host, port)`, created on first use
/// - Only connections whose handshake negotiated keep-alive are cached;
///   others carry a single call and are closed right after it
/// - A background evictor wakes every `persistence_timeout` and closes
///   entries idle for longer than that
/// - The map is guarded by one async mutex shared with the evictor. It is
///   never held across connect, handshake or a call, so a slow destination
///   does not stall the others
/// - The evictor removes entries under that lock and closes them afterwards;
///   closing waits on the connection's own lock, so a call in flight always
///   finishes before its socket is shut.
///
/// # Retry Policy
///
/// A [`RpcError::Connection`] raised by a call on an established connection
/// evicts that connection and the call is retried once on a fresh one. A
/// second failure is returned to the caller. Failing to open a connection is
/// never retried. A method may therefore run
/// twice on the server if the first connection died after the server
/// received the call.
///
/// Timeouts, protocol faults and framing faults are not retried, but the
/// connection they happened on is discarded: a late response would otherwise
/// be read as the answer to the next call. Remote faults leave the
/// connection cached.
///
/// # Example
///
/// ```rust,no_run
/// use sockrpc_client::ConnectionCache;
/// use sockrpc_common::RpcConfig;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> sockrpc_common::Result<()> {
/// let cache = ConnectionCache::new(RpcConfig::default());
/// let value = cache
///     .invoke("127.0.0.1", 46120, "echo", "echo", json!({"payload": "hi"}), None)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl ConnectionCache {
    /// Creates a cache and starts its evictor on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: RpcConfig) -> Self {
        let inner = Arc::new(CacheInner {
            entries: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(run_evictor(
            Arc::downgrade(&inner),
            inner.config.persistence_timeout.max(Duration::from_millis(1)),
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Calls `service.method(args)` on `host:port`.
    ///
    /// `timeout` bounds the wait for the response; `None` uses the
    /// configured socket timeout. With a retry the caller may wait up to
    /// twice that long.
    pub async fn invoke(
        &self,
        host: &str,
        port: u16,
        service: &str,
        method: &str,
        args: RpcArgs,
        timeout: Option<Duration>,
    ) -> Result<RpcValue> {
        let destination = Destination::new(host, port);
        let timeout = timeout.unwrap_or(self.inner.config.socket_timeout);

        let connection = self.checkout(&destination).await?;
        match self
            .call_on(&destination, connection, service, method, args.clone(), timeout)
            .await
        {
            Err(e) if e.is_connection_fault() => {
                tracing::warn!(
                    %destination,
                    error = %e,
                    "Call failed on connection, retrying once on a fresh one"
                );
                let connection = self.checkout(&destination).await?;
                self.call_on(&destination, connection, service, method, args, timeout)
                    .await
            }
            other => other,
        }
    }

    async fn call_on(
        &self,
        destination: &Destination,
        connection: Arc<ClientConnection>,
        service: &str,
        method: &str,
        args: RpcArgs,
        timeout: Duration,
    ) -> Result<RpcValue> {
        let result = connection.invoke(service, method, args, timeout).await;

        if !connection.is_persistent() {
            connection.close().await;
            return result;
        }

        match &result {
            Err(e) if e.poisons_connection() => {
                self.discard(destination, &connection).await;
            }
            _ => self.touch(destination, &connection).await,
        }
        result
    }

    /// Returns the cached connection for `destination`, or opens a new one.
    /// New connections are cached only if they negotiated keep-alive.
    ///
    /// The map lock is not held while connecting. If another task cached a
    /// connection to the same destination in the meantime, that one wins and
    /// the new one is closed.
    async fn checkout(&self, destination: &Destination) -> Result<Arc<ClientConnection>> {
        if let Some(entry) = self.inner.entries.lock().await.get(destination) {
            return Ok(entry.connection.clone());
        }

        let options = ConnectOptions::from(&self.inner.config);
        let connection = Arc::new(ClientConnection::connect(destination.clone(), &options).await?);
        if !connection.is_persistent() {
            return Ok(connection);
        }

        let existing = {
            let mut entries = self.inner.entries.lock().await;
            match entries.get(destination) {
                Some(entry) => Some(entry.connection.clone()),
                None => {
                    entries.insert(
                        destination.clone(),
                        CachedEntry {
                            connection: connection.clone(),
                            last_used_at: Instant::now(),
                        },
                    );
                    None
                }
            }
        };

        match existing {
            Some(winner) => {
                tracing::debug!(%destination, "Connection raced with another caller, closing ours");
                connection.close().await;
                Ok(winner)
            }
            None => Ok(connection),
        }
    }

    async fn touch(&self, destination: &Destination, connection: &Arc<ClientConnection>) {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(destination) {
            if Arc::ptr_eq(&entry.connection, connection) {
                entry.last_used_at = Instant::now();
            }
        }
    }

    /// Removes `connection` from the cache (if it is still the cached one)
    /// and closes it.
    async fn discard(&self, destination: &Destination, connection: &Arc<ClientConnection>) {
        {
            let mut entries = self.inner.entries.lock().await;
            let cached = entries
                .get(destination)
                .is_some_and(|entry| Arc::ptr_eq(&entry.connection, connection));
            if cached {
                entries.remove(destination);
            }
        }
        tracing::debug!(%destination, "Discarding faulty connection");
        connection.close().await;
    }

    /// Number of cached connections.
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Lists cached destinations and how long ago each was last used.
    pub async fn dump_state(&self) -> String {
        let entries = self.inner.entries.lock().await;
        let mut destinations: Vec<_> = entries.iter().collect();
        destinations.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = String::from("Current persistent connections are:\n");
        for (destination, entry) in destinations {
            let _ = writeln!(
                out,
                "    Socket '{}' last used {}ms ago",
                destination,
                entry.last_used_at.elapsed().as_millis()
            );
        }
        out
    }

    /// Closes every cached connection idle for longer than the persistence
    /// timeout. Runs periodically on its own; exposed for callers that want
    /// an immediate sweep.
    pub async fn evict_idle(&self) -> usize {
        self.inner.evict_idle().await
    }

    /// Stops the evictor and closes every cached connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<_> = {
            let mut entries = self.inner.entries.lock().await;
            entries.drain().collect()
        };
        for (destination, entry) in drained {
            tracing::debug!(%destination, "Closing cached connection on shutdown");
            entry.connection.close().await;
        }
    }
}

impl CacheInner {
    async fn evict_idle(&self) -> usize {
        let expired: Vec<(Destination, CachedEntry)> = {
            let mut entries = self.entries.lock().await;
            tracing::debug!(cached = entries.len(), "Beginning cache eviction");
            let idle: Vec<Destination> = entries
                .iter()
                .filter(|(_, entry)| entry.last_used_at.elapsed() > self.config.persistence_timeout)
                .map(|(destination, _)| destination.clone())
                .collect();
            idle.into_iter()
                .filter_map(|destination| {
                    entries
                        .remove(&destination)
                        .map(|entry| (destination, entry))
                })
                .collect()
        };

        let evicted = expired.len();
        for (destination, entry) in expired {
            tracing::debug!(
                %destination,
                idle_ms = entry.last_used_at.elapsed().as_millis() as u64,
                "Evicting idle connection"
            );
            entry.connection.close().await;
        }
        evicted
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_evictor(inner: Weak<CacheInner>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.evict_idle().await;
    }
    tracing::debug!("Connection cache evictor stopped");
}
