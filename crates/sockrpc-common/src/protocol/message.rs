//! sockrpc Wire Messages
//!
//! Every frame on a sockrpc connection carries one JSON object whose `type`
//! field selects the variant:
//!
//! ```text
//! {"type":"control","id":1,"action":"connect","options":{"connection":"keep-alive"}}
//! {"type":"invoke","id":2,"app":"echo","method":"echo","args":{"payload":"hi"}}
//! {"type":"OK","callid":2,"value":{"payload":"hi"}}
//! {"type":"ERROR","callid":2,"message":"not found","callargs":{...}}
//! ```
//!
//! Field names are part of the wire contract; the Rust names differ only
//! where the wire name is unhelpful (`app` is exposed as `service`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{Result, RpcError};

pub type MessageId = u64;

/// Arguments of an invocation (any JSON value)
pub type RpcArgs = serde_json::Value;

/// Result value of a successful invocation (any JSON value)
pub type RpcValue = serde_json::Value;

pub const CONNECT_ACTION: &str = "connect";
pub const CONNECTION_OPTION: &str = "connection";
pub const KEEP_ALIVE: &str = "keep-alive";

/// A sockrpc protocol message.
///
/// Messages are immutable once built; each outbound `Control` or `Invoke`
/// gets its id from the sending connection's [`MessageIdGenerator`], and each
/// response echoes that id as `callid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    #[serde(rename = "control")]
    Control(ControlMessage),
    #[serde(rename = "invoke")]
    Invoke(InvokeMessage),
    #[serde(rename = "OK")]
    ResponseOk(OkResponse),
    #[serde(rename = "ERROR")]
    ResponseError(ErrorResponse),
}

/// Connection-level control message. Only `connect` is defined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    pub id: MessageId,
    pub action: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ControlMessage {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn is_connect(&self) -> bool {
        self.action == CONNECT_ACTION
    }

    /// True if the sender asked for a persistent connection.
    pub fn wants_keep_alive(&self) -> bool {
        self.option(CONNECTION_OPTION) == Some(KEEP_ALIVE)
    }
}

/// A call of `service.method(args)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvokeMessage {
    pub id: MessageId,
    #[serde(rename = "app")]
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: RpcArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OkResponse {
    pub callid: MessageId,
    #[serde(default)]
    pub value: RpcValue,
}

impl OkResponse {
    /// True if this response (to a `connect`) grants a persistent connection.
    pub fn grants_keep_alive(&self) -> bool {
        self.value
            .get(CONNECTION_OPTION)
            .and_then(|v| v.as_str())
            == Some(KEEP_ALIVE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub callid: MessageId,
    pub message: String,
    /// The invocation that failed, echoed back for the caller's diagnostics.
    #[serde(rename = "callargs", default, skip_serializing_if = "Option::is_none")]
    pub original: Option<InvokeMessage>,
}

impl ProtocolMessage {
    /// Builds the handshake message sent right after a connection opens.
    pub fn connect(id: MessageId, keep_alive: bool) -> Self {
        let mut options = BTreeMap::new();
        if keep_alive {
            options.insert(CONNECTION_OPTION.to_string(), KEEP_ALIVE.to_string());
        }
        ProtocolMessage::Control(ControlMessage {
            id,
            action: CONNECT_ACTION.to_string(),
            options,
        })
    }

    pub fn invoke(
        id: MessageId,
        service: impl Into<String>,
        method: impl Into<String>,
        args: RpcArgs,
    ) -> Self {
        ProtocolMessage::Invoke(InvokeMessage {
            id,
            service: service.into(),
            method: method.into(),
            args,
        })
    }

    pub fn ok(callid: MessageId, value: RpcValue) -> Self {
        ProtocolMessage::ResponseOk(OkResponse { callid, value })
    }

    pub fn error(
        callid: MessageId,
        message: impl Into<String>,
        original: Option<InvokeMessage>,
    ) -> Self {
        ProtocolMessage::ResponseError(ErrorResponse {
            callid,
            message: message.into(),
            original,
        })
    }

    /// The wire discriminant of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::Control(_) => "control",
            ProtocolMessage::Invoke(_) => "invoke",
            ProtocolMessage::ResponseOk(_) => "OK",
            ProtocolMessage::ResponseError(_) => "ERROR",
        }
    }

    /// `id` for requests, `callid` for responses.
    pub fn id(&self) -> MessageId {
        match self {
            ProtocolMessage::Control(m) => m.id,
            ProtocolMessage::Invoke(m) => m.id,
            ProtocolMessage::ResponseOk(m) => m.callid,
            ProtocolMessage::ResponseError(m) => m.callid,
        }
    }

    /// Renders the canonical JSON form of this message.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a message, dispatching on its `type` field.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] if the payload is not JSON, has a
    /// missing or unknown `type`, or lacks a field the variant requires.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RpcError::Protocol(format!("Malformed message: {}", e)))
    }
}

/// Per-connection source of message ids.
///
/// Ids only need to be unique among one connection's outstanding requests,
/// so a plain counter is enough.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> MessageId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
