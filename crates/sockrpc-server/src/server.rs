use crate::registry::HandlerRegistry;
use crate::responder::Responder;
use sockrpc_common::protocol::error::{Result, RpcError};
use sockrpc_common::RpcConfig;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// State shared between a running server and its handles.
struct ServerState {
    local_addr: SocketAddr,
    registry: HandlerRegistry,
    config: Arc<RpcConfig>,
    shutdown: CancellationToken,
    accepted: AtomicUsize,
}

impl ServerState {
    fn dump_state(&self) -> String {
        let mut out = format!("Server listening on {}\n", self.local_addr);
        let _ = writeln!(
            out,
            "Connections accepted: {}",
            self.accepted.load(Ordering::Relaxed)
        );
        out.push_str("Registered methods:\n");
        for (service, method) in self.registry.methods() {
            let _ = writeln!(out, "    {}.{}", service, method);
        }
        out
    }
}

/// TCP listener dispatching calls to a [`HandlerRegistry`].
///
/// Each accepted connection is served by its own [`Responder`] task. The
/// accept loop waits at most the configured poll granularity per accept so
/// it notices the shutdown signal promptly; once signalled it stops
/// accepting and waits for the live responders, which observe the same
/// signal, to finish.
///
/// # Example
///
/// ```rust,no_run
/// use sockrpc_common::RpcConfig;
/// use sockrpc_server::{services, HandlerRegistry, RpcServer};
///
/// # #[tokio::main]
/// # async fn main() -> sockrpc_common::Result<()> {
/// let registry = HandlerRegistry::new();
/// services::register_echo(&registry);
///
/// let server = RpcServer::bind(RpcConfig::default(), registry).await?;
/// println!("listening on {}", server.local_addr());
/// server.run().await
/// # }
/// ```
pub struct RpcServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl RpcServer {
    /// Binds the configured host and port. Port 0 lets the OS pick one.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if the configuration is invalid and
    /// [`RpcError::Bind`] if the address cannot be bound.
    pub async fn bind(config: RpcConfig, registry: HandlerRegistry) -> Result<Self> {
        config.validate()?;

        let bind_addr = format!("{}:{}", config.server_host, config.server_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| RpcError::Bind(format!("{}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RpcError::Bind(format!("Failed to get local addr: {}", e)))?;

        tracing::info!(addr = %local_addr, "RPC server bound");

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                local_addr,
                registry,
                config: Arc::new(config),
                shutdown: CancellationToken::new(),
                accepted: AtomicUsize::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.state.registry
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Number of connections accepted so far.
    pub fn connections_accepted(&self) -> usize {
        self.state.accepted.load(Ordering::Relaxed)
    }

    /// Describes the bound address, accepted connections and registered
    /// methods.
    pub fn dump_state(&self) -> String {
        self.state.dump_state()
    }

    /// Accepts connections until the shutdown token is cancelled, then waits
    /// for every responder to finish.
    pub async fn run(self) -> Result<()> {
        let state = self.state;
        let granularity = state.config.poll_granularity;
        let responders = TaskTracker::new();

        while !state.shutdown.is_cancelled() {
            let (stream, peer) =
                match tokio::time::timeout(granularity, self.listener.accept()).await {
                    Err(_) => continue,
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        backoff(granularity, &state.shutdown).await;
                        continue;
                    }
                };

            state.accepted.fetch_add(1, Ordering::Relaxed);
            let _ = stream.set_nodelay(true);
            tracing::debug!(peer = %peer, "Accepted connection");

            let responder = Responder::new(
                stream,
                peer.to_string(),
                state.registry.clone(),
                state.config.clone(),
                state.shutdown.clone(),
            );
            responders.spawn(responder.run());
        }

        drop(self.listener);
        responders.close();
        responders.wait().await;

        tracing::info!(addr = %state.local_addr, "RPC server stopped");
        Ok(())
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> ServerHandle {
        let state = self.state.clone();
        let task = tokio::spawn(self.run());
        ServerHandle { state, task }
    }
}

/// Pauses the accept loop for `period` after a failed accept, or until
/// shutdown.
async fn backoff(period: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(period) => {}
    }
}

/// Handle to a server running on a background task.
pub struct ServerHandle {
    state: Arc<ServerState>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    pub fn port(&self) -> u16 {
        self.state.local_addr.port()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.state.registry
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.accepted.load(Ordering::Relaxed)
    }

    pub fn dump_state(&self) -> String {
        self.state.dump_state()
    }

    /// Signals shutdown and waits for the listener and every responder to
    /// stop.
    pub async fn shutdown(self) -> Result<()> {
        self.state.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RpcError::Connection(format!("Server task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services;
    use serde_json::json;
    use sockrpc_common::protocol::ProtocolMessage;
    use sockrpc_common::transport::MessageChannel;
    use std::time::Instant;

    fn test_config() -> RpcConfig {
        RpcConfig::default()
            .with_poll_granularity(Duration::from_millis(20))
            .with_socket_timeout(Duration::from_millis(500))
    }

    fn echo_registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        services::register_echo(&registry);
        registry
    }

    async fn open(port: u16) -> MessageChannel {
        let mut ch = MessageChannel::connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        ch.set_timeout(Some(Duration::from_secs(2)));
        ch.send_message(&ProtocolMessage::connect(1, true))
            .await
            .unwrap();
        let reply = ch.receive_message().await.unwrap().unwrap();
        assert_eq!(
            reply,
            ProtocolMessage::ok(1, json!({"connection": "keep-alive"}))
        );
        ch
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let server = RpcServer::bind(test_config(), echo_registry()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.connections_accepted(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = RpcServer::bind(test_config(), echo_registry()).await.unwrap();
        let port = first.local_addr().port();

        let result = RpcServer::bind(test_config().with_server_port(port), echo_registry()).await;
        assert!(matches!(result, Err(RpcError::Bind(_))));
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = test_config().with_poll_granularity(Duration::ZERO);
        let result = RpcServer::bind(config, echo_registry()).await;
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[tokio::test]
    async fn test_serves_concurrent_connections() {
        let handle = RpcServer::bind(test_config(), echo_registry())
            .await
            .unwrap()
            .spawn();

        let mut a = open(handle.port()).await;
        let mut b = open(handle.port()).await;

        b.send_message(&ProtocolMessage::invoke(2, "echo", "echo", json!("b")))
            .await
            .unwrap();
        a.send_message(&ProtocolMessage::invoke(2, "echo", "echo", json!("a")))
            .await
            .unwrap();

        assert_eq!(
            a.receive_message().await.unwrap().unwrap(),
            ProtocolMessage::ok(2, json!("a"))
        );
        assert_eq!(
            b.receive_message().await.unwrap().unwrap(),
            ProtocolMessage::ok(2, json!("b"))
        );
        assert_eq!(handle.connections_accepted(), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_connections() {
        let handle = RpcServer::bind(test_config(), echo_registry())
            .await
            .unwrap()
            .spawn();
        let port = handle.port();
        let mut ch = open(port).await;

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap()
            .unwrap();

        assert!(ch.receive_message().await.unwrap().is_none());
        assert!(MessageChannel::connect("127.0.0.1", port, Duration::from_millis(200))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dump_state() {
        let handle = RpcServer::bind(test_config(), echo_registry())
            .await
            .unwrap()
            .spawn();
        let _ch = open(handle.port()).await;

        let dump = handle.dump_state();
        assert!(dump.starts_with(&format!("Server listening on {}\n", handle.local_addr())));
        assert!(dump.contains("Connections accepted: 1\n"));
        assert!(dump.contains("    echo.echo\n"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_backoff_waits_for_period() {
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        backoff(Duration::from_millis(100), &shutdown).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_accept_backoff_ends_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let started = Instant::now();
        backoff(Duration::from_secs(10), &shutdown).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
