//! Services bundled with the server.

use crate::registry::HandlerRegistry;
use anyhow::{anyhow, bail};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

pub const ECHO_SERVICE: &str = "echo";
pub const ECHO_METHOD: &str = "echo";

pub const DATAXFER_SERVICE: &str = "dataxferrpc";
pub const DATAXFER_METHOD: &str = "dataxfer";

/// Keys and tags of the `dataxferrpc.dataxfer` request header.
pub mod dataxfer {
    pub const HEADER_KEY: &str = "header";
    pub const TAG_KEY: &str = "tag";
    pub const LENGTH_KEY: &str = "xferLength";
    pub const DATA_KEY: &str = "data";
    /// Tag a request must carry, compared case-insensitively.
    pub const REQUEST_TAG: &str = "xfer";
    /// Tag written into the header of a successful response.
    pub const RESPONSE_TAG: &str = "okay";
}

/// Registers `echo.echo`, which returns its arguments unchanged.
pub fn register_echo(registry: &HandlerRegistry) {
    registry.register(ECHO_SERVICE, ECHO_METHOD, |args| async move { Ok(args) });
}

/// Registers `dataxferrpc.dataxfer`.
///
/// The request is `{"header": {"tag": "xfer", "xferLength": n}}`. The reply
/// is the request with the tag rewritten to `okay` and a `data` field holding
/// `n` zero bytes, base64 encoded. A request whose encoded data alone would
/// exceed `max_message_length` is rejected.
pub fn register_dataxfer(registry: &HandlerRegistry, max_message_length: usize) {
    registry.register(DATAXFER_SERVICE, DATAXFER_METHOD, move |args| async move {
        transfer(args, max_message_length)
    });
}

fn transfer(mut args: Value, max_message_length: usize) -> anyhow::Result<Value> {
    let length = requested_length(&args)
        .ok_or_else(|| anyhow!("Missing or incorrect header value: '{}'", header_text(&args)))?;

    let encoded_length = usize::try_from(length)
        .ok()
        .and_then(|n| base64::encoded_len(n, true).map(|encoded| (n, encoded)));
    let length = match encoded_length {
        Some((n, encoded)) if encoded <= max_message_length => n,
        _ => bail!(
            "Requested transfer of {} bytes exceeds the maximum message length of {} bytes",
            length,
            max_message_length
        ),
    };

    let Some(fields) = args.as_object_mut() else {
        bail!("Missing or incorrect header value: 'null'");
    };
    if let Some(Value::Object(header)) = fields.get_mut(dataxfer::HEADER_KEY) {
        header.insert(dataxfer::TAG_KEY.to_string(), Value::from(dataxfer::RESPONSE_TAG));
    }
    fields.insert(
        dataxfer::DATA_KEY.to_string(),
        Value::from(STANDARD.encode(vec![0u8; length])),
    );

    tracing::debug!(bytes = length, "Data transfer served");
    Ok(args)
}

/// The requested length, if the header is well formed.
fn requested_length(args: &Value) -> Option<u64> {
    let header = args.get(dataxfer::HEADER_KEY)?;
    let tag = header.get(dataxfer::TAG_KEY)?.as_str()?;
    if !tag.eq_ignore_ascii_case(dataxfer::REQUEST_TAG) {
        return None;
    }
    header.get(dataxfer::LENGTH_KEY)?.as_u64()
}

fn header_text(args: &Value) -> String {
    args.get(dataxfer::HEADER_KEY)
        .map(Value::to_string)
        .unwrap_or_else(|| "null".to_string())
}
