//! sockrpc Transport Layer
//!
//! Length-prefixed framing over a single stream socket.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one connection per destination, reused while the
//!   peers agree on keep-alive
//! - **Wire Format**: `[4-byte length prefix as u32 little-endian] + [payload]`
//! - **Payload**: a JSON-encoded [`ProtocolMessage`](crate::protocol::ProtocolMessage)
//!   for RPC traffic; raw bytes, strings and integers are also supported
//!
//! # Components
//!
//! - **[`MessageChannel`]**: framed send/receive with per-channel timeouts
//!   and a configurable maximum payload length

pub mod channel;

pub use channel::{MessageChannel, DEFAULT_MAX_READ_LENGTH, LENGTH_PREFIX_SIZE};
