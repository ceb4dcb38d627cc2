//! sockrpc Server
//!
//! Serving side of sockrpc: an [`RpcServer`] accepts TCP connections and
//! hands each one to a [`Responder`], which performs the handshake and then
//! dispatches every call to the handler registered for its
//! `(service, method)` in a [`HandlerRegistry`].

pub mod registry;
pub mod responder;
pub mod server;
pub mod services;

pub use registry::{Handler, HandlerFuture, HandlerRegistry};
pub use responder::{CloseReason, Responder};
pub use server::{RpcServer, ServerHandle};
