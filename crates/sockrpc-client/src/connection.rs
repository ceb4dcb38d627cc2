use sockrpc_common::protocol::error::{Result, RpcError};
use sockrpc_common::protocol::{MessageIdGenerator, ProtocolMessage, RpcArgs, RpcValue};
use sockrpc_common::transport::MessageChannel;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

/// A `(host, port)` pair identifying a remote sockrpc server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Options for opening a [`ClientConnection`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Ask the server to keep the connection open across calls
    pub keep_alive: bool,
    /// Bound on connecting and on waiting for the handshake response
    pub handshake_timeout: Duration,
    /// Largest response payload accepted
    pub max_read_length: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            handshake_timeout: Duration::from_millis(2000),
            max_read_length: sockrpc_common::transport::DEFAULT_MAX_READ_LENGTH,
        }
    }
}

impl From<&sockrpc_common::RpcConfig> for ConnectOptions {
    fn from(config: &sockrpc_common::RpcConfig) -> Self {
        Self {
            keep_alive: config.keep_alive,
            handshake_timeout: config.socket_timeout,
            max_read_length: config.max_message_length,
        }
    }
}

/// Observable state of a [`ClientConnection`].
///
/// `Connecting` and `Handshaking` only exist inside
/// [`ClientConnection::connect`]; a constructed connection starts `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    Invoking,
    Closed,
}

/// One outbound sockrpc connection.
///
/// The connection performs the `connect` handshake when it is opened and
/// then carries calls one at a time: concurrent [`invoke`](Self::invoke)
/// calls on the same connection queue on an internal async mutex, because
/// the protocol has no way to match more than one outstanding call.
///
/// # Example
///
/// ```rust,no_run
/// use sockrpc_client::{ClientConnection, ConnectOptions, Destination};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> sockrpc_common::Result<()> {
/// let options = ConnectOptions { keep_alive: false, ..Default::default() };
/// let conn = ClientConnection::connect(Destination::new("127.0.0.1", 46120), &options).await?;
/// let value = conn
///     .invoke("echo", "echo", json!({"payload": "hi"}), Duration::from_secs(2))
///     .await?;
/// conn.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ClientConnection {
    destination: Destination,
    channel: Mutex<Option<MessageChannel>>,
    ids: MessageIdGenerator,
    persistent: bool,
}

impl ClientConnection {
    /// Opens a connection and performs the handshake.
    ///
    /// The connection is persistent only if `options.keep_alive` is set and
    /// the server's `OK` echoes `connection: keep-alive`.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Connection`] if the server cannot be reached or closes
    ///   the connection during the handshake
    /// - [`RpcError::Remote`] if the server answers the handshake with `ERROR`
    /// - [`RpcError::Protocol`] for any other response type or a mismatched
    ///   `callid`
    /// - [`RpcError::Timeout`] if no response arrives within
    ///   `options.handshake_timeout`
    pub async fn connect(destination: Destination, options: &ConnectOptions) -> Result<Self> {
        tracing::debug!(%destination, "Connecting");
        let mut channel = MessageChannel::connect(
            &destination.host,
            destination.port,
            options.handshake_timeout,
        )
        .await?;
        channel.set_timeout(Some(options.handshake_timeout));
        channel.set_max_read_length(options.max_read_length);

        let ids = MessageIdGenerator::new();
        let connect = ProtocolMessage::connect(ids.next_id(), options.keep_alive);

        tracing::debug!(%destination, keep_alive = options.keep_alive, "Handshaking");
        let persistent = match Self::handshake(&mut channel, &connect).await {
            Ok(granted) => options.keep_alive && granted,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        tracing::debug!(%destination, persistent, "Connection ready");

        Ok(Self {
            destination,
            channel: Mutex::new(Some(channel)),
            ids,
            persistent,
        })
    }

    /// Sends the connect message and returns whether keep-alive was granted.
    async fn handshake(channel: &mut MessageChannel, connect: &ProtocolMessage) -> Result<bool> {
        channel.send_message(connect).await?;
        let response = channel.receive_message().await?.ok_or_else(|| {
            RpcError::Connection("Connection closed by server during handshake".to_string())
        })?;

        match response {
            ProtocolMessage::ResponseOk(ok) if ok.callid == connect.id() => Ok(ok.grants_keep_alive()),
            ProtocolMessage::ResponseOk(ok) => Err(RpcError::Protocol(format!(
                "Handshake response id {} does not match request id {}",
                ok.callid,
                connect.id()
            ))),
            ProtocolMessage::ResponseError(err) => Err(RpcError::Remote(err.message)),
            other => Err(RpcError::Protocol(format!(
                "Server sent incorrect type during handshake: {}",
                other.type_name()
            ))),
        }
    }

    /// Calls `service.method(args)` and waits up to `timeout` for the result.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] carrying the server's message for an `ERROR`
    ///   response
    /// - [`RpcError::Protocol`] for a response of the wrong type or with a
    ///   `callid` other than this call's id
    /// - [`RpcError::Timeout`] if no response arrives in time
    /// - [`RpcError::Connection`] if the socket fails or the server closes it;
    ///   the connection should not be used again
    /// - [`RpcError::Framing`] if the response frame is malformed
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        args: RpcArgs,
        timeout: Duration,
    ) -> Result<RpcValue> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or_else(|| {
            RpcError::Connection(format!("Connection to {} is closed", self.destination))
        })?;

        channel.set_timeout(Some(timeout));

        let invoke = ProtocolMessage::invoke(self.ids.next_id(), service, method, args);
        tracing::debug!(
            destination = %self.destination,
            id = invoke.id(),
            "Sending invocation of {}.{}",
            service,
            method
        );
        channel.send_message(&invoke).await?;

        let response = channel.receive_message().await?.ok_or_else(|| {
            RpcError::Connection(format!(
                "Connection closed by {} while awaiting response",
                self.destination
            ))
        })?;

        let callid = response.id();
        if callid != invoke.id() {
            return Err(RpcError::Protocol(format!(
                "Response id {} does not match request id {}",
                callid,
                invoke.id()
            )));
        }

        match response {
            ProtocolMessage::ResponseOk(ok) => Ok(ok.value),
            ProtocolMessage::ResponseError(err) => Err(RpcError::Remote(err.message)),
            other => Err(RpcError::Protocol(format!(
                "Server sent incorrect type: {}",
                other.type_name()
            ))),
        }
    }

    /// Closes the connection, waiting for an in-flight call to finish first.
    /// Closing an already closed connection does nothing.
    pub async fn close(&self) {
        let mut guard = self.channel.lock().await;
        if let Some(mut channel) = guard.take() {
            channel.close().await;
            tracing::debug!(destination = %self.destination, "Connection closed");
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// True if both sides agreed to keep this connection open across calls.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn state(&self) -> ConnectionState {
        match self.channel.try_lock() {
            Ok(guard) if guard.is_some() => ConnectionState::Ready,
            Ok(_) => ConnectionState::Closed,
            Err(_) => ConnectionState::Invoking,
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("destination", &self.destination)
            .field("persistent", &self.persistent)
            .field("state", &self.state())
            .finish()
    }
}
