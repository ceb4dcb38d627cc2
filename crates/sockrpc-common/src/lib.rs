//! sockrpc Common Types and Transport
//!
//! This crate provides the wire protocol, framing layer and configuration
//! shared by the sockrpc client and server.
//!
//! # Overview
//!
//! sockrpc is a small remote-procedure-call runtime built directly on TCP
//! stream sockets:
//!
//! - **Protocol Layer**: the tagged [`ProtocolMessage`] (control, invoke,
//!   OK, ERROR) and the [`RpcError`] fault taxonomy
//! - **Transport Layer**: [`MessageChannel`](transport::MessageChannel),
//!   length-prefixed framing with timeouts and a maximum payload size
//! - **Configuration**: [`RpcConfig`]
//!
//! # Architecture
//!
//! - **Transport**: TCP, persistent when both sides agree on keep-alive
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 little-endian] + [JSON data]`
//! - **Handshake**: every connection opens with a `connect` control message
//!   before any call is made
//!
//! # Example
//!
//! ```
//! use sockrpc_common::ProtocolMessage;
//! use serde_json::json;
//!
//! let invoke = ProtocolMessage::invoke(2, "echo", "echo", json!({"payload": "hi"}));
//! let bytes = invoke.marshal().unwrap();
//! assert_eq!(ProtocolMessage::unmarshal(&bytes).unwrap(), invoke);
//! ```

pub mod config;
pub mod protocol;
pub mod transport;

pub use config::RpcConfig;
pub use protocol::*;
