//! # sockrpc
//!
//! Length-prefixed JSON RPC over persistent TCP connections.
//!
//! This package gathers the three library crates of the workspace:
//!
//! - [`common`]: framing, wire messages, errors and configuration
//! - [`client`]: handshaking connections and the connection cache
//! - [`server`]: listener, responders and the handler registry
//!
//! # Example
//!
//! ```rust,no_run
//! use sockrpc::{ConnectionCache, HandlerRegistry, RpcConfig, RpcServer};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> sockrpc::Result<()> {
//! let registry = HandlerRegistry::new();
//! sockrpc::server::services::register_echo(&registry);
//! let server = RpcServer::bind(RpcConfig::default(), registry).await?.spawn();
//!
//! let cache = ConnectionCache::new(RpcConfig::default());
//! let value = cache
//!     .invoke("127.0.0.1", server.port(), "echo", "echo", json!({"payload": "hi"}), None)
//!     .await?;
//! assert_eq!(value, json!({"payload": "hi"}));
//!
//! server.shutdown().await
//! # }
//! ```

pub use sockrpc_client as client;
pub use sockrpc_common as common;
pub use sockrpc_server as server;

pub use sockrpc_client::{invoke, ClientConnection, ConnectOptions, ConnectionCache, Destination};
pub use sockrpc_common::{ProtocolMessage, Result, RpcConfig, RpcError};
pub use sockrpc_server::{HandlerRegistry, RpcServer, ServerHandle};
