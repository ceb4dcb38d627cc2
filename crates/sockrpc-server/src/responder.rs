use crate::registry::{Handler, HandlerRegistry};
use futures_util::FutureExt;
use serde_json::json;
use sockrpc_common::protocol::error::{Result, RpcError};
use sockrpc_common::protocol::{
    InvokeMessage, ProtocolMessage, RpcArgs, RpcValue, CONNECTION_OPTION, KEEP_ALIVE,
};
use std::panic::AssertUnwindSafe;
use sockrpc_common::transport::MessageChannel;
use sockrpc_common::RpcConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Why a [`Responder`] stopped serving its connection.
#[derive(Debug)]
pub enum CloseReason {
    /// The client closed the connection between calls.
    PeerClosed,
    /// The server's shutdown signal fired.
    Shutdown,
    /// No call arrived within the idle budget.
    IdleExpired,
    /// A non-persistent connection carried its one call.
    SingleCallServed,
    /// The first message was not a `connect` request.
    HandshakeRejected,
    /// The connection failed or the client broke the protocol.
    Fault(RpcError),
}

/// Serves one accepted connection: handshake, then calls until closed.
///
/// A responder handles one call at a time. While idle it reads with the
/// configured poll granularity as its timeout, so that between reads it can
/// notice the shutdown signal and its own idle expiry. Errors raised by
/// handlers are sent back as `ERROR` responses and the connection stays open.
pub struct Responder<S = TcpStream> {
    channel: MessageChannel<S>,
    peer: String,
    registry: HandlerRegistry,
    config: Arc<RpcConfig>,
    shutdown: CancellationToken,
}

impl<S> Responder<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        registry: HandlerRegistry,
        config: Arc<RpcConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut channel = MessageChannel::new(stream);
        channel.set_max_read_length(config.max_message_length);
        Self {
            channel,
            peer: peer.into(),
            registry,
            config,
            shutdown,
        }
    }

    /// Runs the connection to completion. The channel is closed on every
    /// exit path.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.serve().await;
        self.channel.close().await;

        match &reason {
            CloseReason::Fault(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "Responder stopped on fault");
            }
            reason => {
                tracing::debug!(peer = %self.peer, ?reason, "Responder closed connection");
            }
        }
        reason
    }

    async fn serve(&mut self) -> CloseReason {
        let shutdown = self.shutdown.clone();
        let handshake = tokio::select! {
            _ = shutdown.cancelled() => return CloseReason::Shutdown,
            result = self.handshake() => result,
        };
        let persistent = match handshake {
            Ok(Some(persistent)) => persistent,
            Ok(None) => return CloseReason::PeerClosed,
            Err(RpcError::Protocol(e)) | Err(RpcError::Framing(e)) => {
                tracing::debug!(peer = %self.peer, error = %e, "Malformed handshake");
                return CloseReason::HandshakeRejected;
            }
            Err(e) => return CloseReason::Fault(e),
        };

        // A one-shot connection gets a single socket timeout to deliver its call.
        let idle_budget = if persistent {
            self.config.persistence_timeout
        } else {
            self.config.socket_timeout
        };

        self.channel.set_timeout(Some(self.config.poll_granularity));
        let mut last_used = Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                return CloseReason::Shutdown;
            }
            if last_used.elapsed() > idle_budget {
                return CloseReason::IdleExpired;
            }

            let invoke = match self.channel.receive_message().await {
                Ok(Some(ProtocolMessage::Invoke(invoke))) => invoke,
                Ok(Some(other)) => {
                    return CloseReason::Fault(RpcError::Protocol(format!(
                        "expected invoke, got {}",
                        other.type_name()
                    )));
                }
                Ok(None) => return CloseReason::PeerClosed,
                Err(RpcError::Timeout(_)) => continue,
                Err(e) => return CloseReason::Fault(e),
            };

            if let Err(e) = self.dispatch(invoke).await {
                return CloseReason::Fault(e);
            }
            last_used = Instant::now();

            if !persistent {
                return CloseReason::SingleCallServed;
            }
        }
    }

    /// Reads the `connect` request and answers it. Returns whether the
    /// connection is persistent, or `None` if the client left first.
    async fn handshake(&mut self) -> Result<Option<bool>> {
        self.channel.set_timeout(Some(self.config.socket_timeout));

        let control = match self.channel.receive_message().await? {
            Some(ProtocolMessage::Control(control)) if control.is_connect() => control,
            Some(other) => {
                return Err(RpcError::Protocol(format!(
                    "expected connect, got {}",
                    other.type_name()
                )))
            }
            None => return Ok(None),
        };

        let persistent = control.wants_keep_alive();
        let value = if persistent {
            json!({ CONNECTION_OPTION: KEEP_ALIVE })
        } else {
            json!({})
        };
        self.channel
            .send_message(&ProtocolMessage::ok(control.id, value))
            .await?;

        tracing::debug!(peer = %self.peer, persistent, "Handshake complete");
        Ok(Some(persistent))
    }

    /// Runs one call and sends its response.
    async fn dispatch(&mut self, invoke: InvokeMessage) -> Result<()> {
        tracing::debug!(
            peer = %self.peer,
            service = %invoke.service,
            method = %invoke.method,
            id = invoke.id,
            "Dispatching call"
        );

        let response = match self.registry.lookup(&invoke.service, &invoke.method) {
            None => {
                let message = format!("{}.{} not found", invoke.service, invoke.method);
                ProtocolMessage::error(invoke.id, message, Some(invoke))
            }
            Some(handler) => match run_handler(handler, invoke.args.clone()).await {
                Ok(value) => ProtocolMessage::ok(invoke.id, value),
                Err(e) => {
                    tracing::debug!(
                        peer = %self.peer,
                        service = %invoke.service,
                        method = %invoke.method,
                        error = %e,
                        "Handler failed"
                    );
                    ProtocolMessage::error(invoke.id, e.to_string(), Some(invoke))
                }
            },
        };

        self.channel.send_message(&response).await
    }
}

/// Runs a handler, turning a panic into an ordinary handler error so the
/// client still gets an answer.
async fn run_handler(handler: Handler, args: RpcArgs) -> anyhow::Result<RpcValue> {
    match AssertUnwindSafe(handler(args)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("handler panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("handler panicked: {s}")
            } else {
                "handler panicked".to_string()
            };
            Err(anyhow::anyhow!(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn test_config() -> Arc<RpcConfig> {
        Arc::new(
            RpcConfig::default()
                .with_socket_timeout(Duration::from_millis(300))
                .with_poll_granularity(Duration::from_millis(20))
                .with_persistence_timeout(Duration::from_millis(400)),
        )
    }

    fn test_registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register("echo", "echo", |args| async move { Ok(args) });
        registry.register("svc", "fail", |_| async move {
            Err::<Value, _>(anyhow::anyhow!("handler exploded"))
        });
        registry.register("svc", "panic", |_| async move {
            if true {
                panic!("bad input");
            }
            Ok(Value::Null)
        });
        registry
    }

    /// Starts a responder on one end of an in-memory pipe and returns the
    /// client end.
    fn start(
        config: Arc<RpcConfig>,
        shutdown: CancellationToken,
    ) -> (MessageChannel<DuplexStream>, JoinHandle<CloseReason>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let responder = Responder::new(server, "test-peer", test_registry(), config, shutdown);
        let task = tokio::spawn(responder.run());
        let mut channel = MessageChannel::new(client);
        channel.set_timeout(Some(Duration::from_secs(2)));
        (channel, task)
    }

    async fn connect(channel: &mut MessageChannel<DuplexStream>, keep_alive: bool) -> Value {
        channel
            .send_message(&ProtocolMessage::connect(1, keep_alive))
            .await
            .unwrap();
        match channel.receive_message().await.unwrap() {
            Some(ProtocolMessage::ResponseOk(ok)) => {
                assert_eq!(ok.callid, 1);
                ok.value
            }
            other => panic!("expected OK, got {:?}", other),
        }
    }

    async fn call(
        channel: &mut MessageChannel<DuplexStream>,
        id: u64,
        service: &str,
        method: &str,
        args: Value,
    ) -> ProtocolMessage {
        channel
            .send_message(&ProtocolMessage::invoke(id, service, method, args))
            .await
            .unwrap();
        channel.receive_message().await.unwrap().unwrap()
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    #[tokio::test]
    async fn test_handshake_echoes_keep_alive() {
        let (mut ch, _task) = start(test_config(), CancellationToken::new());
        let value = connect(&mut ch, true).await;
        assert_eq!(value, json!({"connection": "keep-alive"}));
    }

    #[tokio::test]
    async fn test_handshake_without_keep_alive() {
        let (mut ch, _task) = start(test_config(), CancellationToken::new());
        let value = connect(&mut ch, false).await;
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn test_unexpected_first_message_closes_silently() {
        let (mut ch, task) = start(test_config(), CancellationToken::new());
        ch.send_message(&ProtocolMessage::invoke(1, "echo", "echo", json!(1)))
            .await
            .unwrap();

        assert!(ch.receive_message().await.unwrap().is_none());
        assert!(matches!(task.await.unwrap(), CloseReason::HandshakeRejected));
    }

    #[tokio::test]
    async fn test_garbage_first_frame_closes_silently() {
        let (mut ch, task) = start(test_config(), CancellationToken::new());
        ch.send_string("not json").await.unwrap();

        assert!(ch.receive_message().await.unwrap().is_none());
        assert!(matches!(task.await.unwrap(), CloseReason::HandshakeRejected));
    }

    // ========================================================================
    // Serving
    // ========================================================================

    #[tokio::test]
    async fn test_serves_calls_until_peer_closes() {
        let (mut ch, task) = start(test_config(), CancellationToken::new());
        connect(&mut ch, true).await;

        for id in 2..5 {
            match call(&mut ch, id, "echo", "echo", json!({"n": id})).await {
                ProtocolMessage::ResponseOk(ok) => {
                    assert_eq!(ok.callid, id);
                    assert_eq!(ok.value, json!({"n": id}));
                }
                other => panic!("expected OK, got {:?}", other),
            }
        }

        ch.close().await;
        assert!(matches!(task.await.unwrap(), CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn test_unknown_method_answers_error_and_keeps_serving() {
        let (mut ch, _task) = start(test_config(), CancellationToken::new());
        connect(&mut ch, true).await;

        match call(&mut ch, 2, "echo", "shout", json!("x")).await {
            ProtocolMessage::ResponseError(err) => {
                assert_eq!(err.callid, 2);
                assert!(err.message.contains("not found"), "{}", err.message);
                assert_eq!(err.original.unwrap().method, "shout");
            }
            other => panic!("expected ERROR, got {:?}", other),
        }

        let next = call(&mut ch, 3, "echo", "echo", json!("still here")).await;
        assert_eq!(next, ProtocolMessage::ok(3, json!("still here")));
    }

    #[tokio::test]
    async fn test_handler_error_answers_error_and_keeps_serving() {
        let (mut ch, _task) = start(test_config(), CancellationToken::new());
        connect(&mut ch, true).await;

        match call(&mut ch, 2, "svc", "fail", json!(null)).await {
            ProtocolMessage::ResponseError(err) => {
                assert_eq!(err.callid, 2);
                assert_eq!(err.message, "handler exploded");
            }
            other => panic!("expected ERROR, got {:?}", other),
        }

        let next = call(&mut ch, 3, "echo", "echo", json!(7)).await;
        assert_eq!(next, ProtocolMessage::ok(3, json!(7)));
    }

    #[tokio::test]
    async fn test_handler_panic_answers_error_and_keeps_serving() {
        let (mut ch, _task) = start(test_config(), CancellationToken::new());
        connect(&mut ch, true).await;

        match call(&mut ch, 2, "svc", "panic", json!(null)).await {
            ProtocolMessage::ResponseError(err) => {
                assert_eq!(err.callid, 2);
                assert_eq!(err.message, "handler panicked: bad input");
            }
            other => panic!("expected ERROR, got {:?}", other),
        }

        let next = call(&mut ch, 3, "echo", "echo", json!(8)).await;
        assert_eq!(next, ProtocolMessage::ok(3, json!(8)));
    }

    #[tokio::test]
    async fn test_one_shot_connection_serves_single_call() {
        let (mut ch, task) = start(test_config(), CancellationToken::new());
        connect(&mut ch, false).await;

        let reply = call(&mut ch, 2, "echo", "echo", json!("once")).await;
        assert_eq!(reply, ProtocolMessage::ok(2, json!("once")));

        assert!(ch.receive_message().await.unwrap().is_none());
        assert!(matches!(task.await.unwrap(), CloseReason::SingleCallServed));
    }

    // ========================================================================
    // Termination
    // ========================================================================

    #[tokio::test]
    async fn test_idle_persistent_connection_expires() {
        let (mut ch, task) = start(test_config(), CancellationToken::new());
        connect(&mut ch, true).await;

        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, CloseReason::IdleExpired));
        assert!(ch.receive_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_shot_connection_waits_one_socket_timeout() {
        let config = RpcConfig::clone(&test_config()).with_persistence_timeout(Duration::from_secs(30));
        let (mut ch, task) = start(Arc::new(config), CancellationToken::new());
        connect(&mut ch, false).await;

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, CloseReason::IdleExpired));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_responder() {
        let shutdown = CancellationToken::new();
        let (mut ch, task) = start(test_config(), shutdown.clone());
        connect(&mut ch, true).await;

        shutdown.cancel();
        let reason = tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn test_shutdown_during_handshake() {
        let config = RpcConfig::clone(&test_config()).with_socket_timeout(Duration::from_secs(10));
        let shutdown = CancellationToken::new();
        let (_ch, task) = start(Arc::new(config), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let reason = tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reason, CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn test_non_invoke_while_serving_is_fault() {
        let (mut ch, task) = start(test_config(), CancellationToken::new());
        connect(&mut ch, true).await;

        ch.send_message(&ProtocolMessage::ok(9, json!(null)))
            .await
            .unwrap();
        assert!(matches!(
            task.await.unwrap(),
            CloseReason::Fault(RpcError::Protocol(_))
        ));
    }
}
