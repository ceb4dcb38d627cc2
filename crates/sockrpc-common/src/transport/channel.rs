use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::ProtocolMessage;

/// Size of the length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a received payload (just under 2 MB)
pub const DEFAULT_MAX_READ_LENGTH: usize = 2_097_148;

/// Bytes requested from the socket per read when no larger frame is pending
const READ_CHUNK: usize = 8 * 1024;

/// Length-prefixed message framing over one byte stream.
///
/// # Wire Format
///
/// ```text
/// [4-byte length as u32 little-endian] [payload]
/// ```
///
/// # Receive Semantics
///
/// - `Ok(None)`: the peer closed the stream cleanly between frames.
/// - [`RpcError::Framing`]: the stream ended inside a length prefix or a
///   payload, or the announced length is negative or above
///   `max_read_length`. The oversized check happens before any payload
///   buffer is allocated.
/// - [`RpcError::Timeout`]: nothing complete arrived within the channel
///   timeout. Bytes received so far stay buffered, so the channel can be
///   read again afterwards.
///
/// # Example
///
/// ```no_run
/// use sockrpc_common::transport::MessageChannel;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> sockrpc_common::Result<()> {
/// let mut channel = MessageChannel::connect("127.0.0.1", 46120, Duration::from_secs(2)).await?;
/// channel.set_timeout(Some(Duration::from_millis(500)));
/// channel.send_string("hello").await?;
/// let reply = channel.receive_string().await?;
/// # Ok(())
/// # }
/// ```
pub struct MessageChannel<S = TcpStream> {
    stream: S,
    read_buf: BytesMut,
    timeout: Option<Duration>,
    max_read_length: usize,
    closed: bool,
}

impl MessageChannel<TcpStream> {
    /// Opens a TCP connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`] if the address cannot be resolved,
    /// the connection is refused, or it is not established within
    /// `connect_timeout`.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::Connection(format!(
                    "Failed to connect to {}:{}: {}",
                    host, port, e
                )))
            }
            Err(_) => {
                return Err(RpcError::Connection(format!(
                    "Failed to connect to {}:{}: timed out after {}ms",
                    host,
                    port,
                    connect_timeout.as_millis()
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        self.stream
            .peer_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get peer addr: {}", e)))
    }

    /// Enables or disables Nagle's algorithm, returning the previous value.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<bool> {
        let previous = self
            .stream
            .nodelay()
            .map_err(|e| Self::map_io_error(e, "reading TCP_NODELAY", None))?;
        self.stream
            .set_nodelay(nodelay)
            .map_err(|e| Self::map_io_error(e, "setting TCP_NODELAY", None))?;
        Ok(previous)
    }
}

impl<S> MessageChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already connected stream. No timeout is set and the maximum
    /// read length is [`DEFAULT_MAX_READ_LENGTH`].
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            timeout: None,
            max_read_length: DEFAULT_MAX_READ_LENGTH,
            closed: false,
        }
    }

    /// Sets the timeout applied to each subsequent receive, returning the
    /// previous one. `None` waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Option<Duration> {
        std::mem::replace(&mut self.timeout, timeout)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets the largest payload this channel will accept, returning the
    /// previous limit.
    pub fn set_max_read_length(&mut self, max_read_length: usize) -> usize {
        std::mem::replace(&mut self.max_read_length, max_read_length)
    }

    pub fn max_read_length(&self) -> usize {
        self.max_read_length
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Sends one frame: the little-endian length followed by `data`.
    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= i32::MAX as u32)
            .ok_or_else(|| {
                RpcError::Framing(format!("Message too large to frame: {} bytes", data.len()))
            })?;

        let timeout = self.timeout;
        self.stream
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix", timeout))?;
        self.stream
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing data", timeout))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream", timeout))?;

        Ok(())
    }

    pub async fn send_string(&mut self, text: &str) -> Result<()> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Sends a 4-byte little-endian integer as the frame payload.
    pub async fn send_int(&mut self, value: i32) -> Result<()> {
        self.send_bytes(&value.to_le_bytes()).await
    }

    /// Sends the JSON encoding of `value`.
    pub async fn send_structured<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.send_bytes(&encoded).await
    }

    pub async fn send_message(&mut self, message: &ProtocolMessage) -> Result<()> {
        let encoded = message.marshal()?;
        self.send_bytes(&encoded).await
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// Receives one frame payload, or `None` on a clean end of stream.
    pub async fn receive_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.read_frame()).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Timeout(limit.as_millis() as u64)),
            },
            None => self.read_frame().await,
        }
    }

    pub async fn receive_string(&mut self) -> Result<Option<String>> {
        match self.receive_bytes().await? {
            Some(payload) => String::from_utf8(payload)
                .map(Some)
                .map_err(|e| RpcError::Protocol(format!("Payload is not valid UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn receive_int(&mut self) -> Result<Option<i32>> {
        match self.receive_bytes().await? {
            Some(payload) => {
                let bytes: [u8; 4] = payload.as_slice().try_into().map_err(|_| {
                    RpcError::Framing(format!(
                        "Integer frame must be 4 bytes, got {}",
                        payload.len()
                    ))
                })?;
                Ok(Some(i32::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub async fn receive_structured<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.receive_bytes().await? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn receive_message(&mut self) -> Result<Option<ProtocolMessage>> {
        match self.receive_bytes().await? {
            Some(payload) => ProtocolMessage::unmarshal(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Shuts the stream down. Further sends and receives fail with
    /// [`RpcError::Connection`]; closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.read_buf.clear();
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(error = %e, "Error while shutting down channel");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(RpcError::Connection("Channel is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Reads until one whole frame is buffered. Only `read_buf` is awaited,
    /// which is cancel safe, so an expired timeout leaves partial input in
    /// `read_buf` for the next attempt.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(payload) = self.take_frame()? {
                return Ok(Some(payload));
            }

            if self.read_buf.capacity() - self.read_buf.len() == 0 {
                self.read_buf.reserve(READ_CHUNK);
            }

            let timeout = self.timeout;
            let read = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| Self::map_io_error(e, "reading frame", timeout))?;

            if read == 0 {
                return match self.read_buf.len() {
                    0 => Ok(None),
                    n if n < LENGTH_PREFIX_SIZE => Err(RpcError::Framing(format!(
                        "Stream closed after {} of {} length prefix bytes",
                        n, LENGTH_PREFIX_SIZE
                    ))),
                    n => Err(RpcError::Framing(format!(
                        "Stream closed after {} of {} payload bytes",
                        n - LENGTH_PREFIX_SIZE,
                        self.announced_length().unwrap_or(0)
                    ))),
                };
            }
        }
    }

    /// Splits one complete frame off the front of `read_buf`, validating the
    /// announced length as soon as the prefix is available.
    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(length) = self.announced_length() else {
            return Ok(None);
        };
        let length = usize::try_from(length)
            .map_err(|_| RpcError::Framing(format!("Negative message length: {}", length)))?;
        if length > self.max_read_length {
            return Err(RpcError::Framing(format!(
                "Message too large: {} bytes (max {} bytes)",
                length, self.max_read_length
            )));
        }

        let frame_len = LENGTH_PREFIX_SIZE + length;
        if self.read_buf.len() < frame_len {
            self.read_buf.reserve(frame_len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.read_buf.split_to(length).to_vec()))
    }

    fn announced_length(&self) -> Option<i32> {
        let prefix: [u8; LENGTH_PREFIX_SIZE] =
            self.read_buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
        Some(i32::from_le_bytes(prefix))
    }

    /// Map IO errors to the fault taxonomy
    ///
    /// - Timeouts/would block -> `Timeout`
    /// - Everything else means the socket is unusable -> `Connection`
    fn map_io_error(err: std::io::Error, context: &str, timeout: Option<Duration>) -> RpcError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                RpcError::Timeout(timeout.map(|t| t.as_millis() as u64).unwrap_or(0))
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => {
                RpcError::Connection(format!("{}: Connection lost", context))
            }
            _ => RpcError::Connection(format!("{}: {}", context, err)),
        }
    }
}
