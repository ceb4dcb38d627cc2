use thiserror::Error;

/// Every fault the RPC runtime can raise.
///
/// The first five variants map one-to-one onto the failure classes a caller
/// has to tell apart: a broken frame, a well-framed but nonsensical message,
/// an explicit error from the peer, an expired wait, and a dead socket.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Bad or oversized length prefix, or the stream ended inside a frame.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Wrong message type, id mismatch or malformed payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an `ERROR` response.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// Socket-level failure: refused, reset, closed mid-call.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind listener: {0}")]
    Bind(String),
}

impl RpcError {
    /// Returns true for faults that mean the underlying connection can no
    /// longer be trusted and a fresh one may succeed.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, RpcError::Connection(_))
    }

    /// Returns true for faults after which the stream position is unknown,
    /// so the connection must not carry another call.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            RpcError::Connection(_)
                | RpcError::Timeout(_)
                | RpcError::Framing(_)
                | RpcError::Protocol(_)
        )
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
