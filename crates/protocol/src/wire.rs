//! Request serialization and inbound-line classification
//!
//! One connection carries two logical channels: command replies (objects
//! with a `"return"` or `"error"` member, delivered in request order) and
//! unsolicited events (objects with an `"event"` member). This module
//! encodes outbound requests as single JSON lines and sorts inbound lines
//! into the right channel.

use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Outbound command frame.
#[derive(Debug, Serialize)]
struct Request<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Value>,
}

/// Serialize a command as one newline-terminated JSON line.
pub fn request_line(command: &str, arguments: Option<&Value>) -> Result<String> {
    let mut line = serde_json::to_string(&Request {
        execute: command,
        arguments,
    })?;
    line.push('\n');
    Ok(line)
}

/// Classification of one decoded inbound line.
#[derive(Debug)]
pub enum Inbound {
    /// A command reply, for the oldest in-flight request.
    Response(Value),
    /// An unsolicited notification.
    Event {
        /// Event name, e.g. `RESET`.
        name: String,
        /// Full event object, including any payload.
        payload: Value,
    },
    /// Anything else; logged and skipped by the reader.
    Other(Value),
}

/// Sort a decoded line into response, event, or noise.
pub fn classify(value: Value) -> Inbound {
    if let Some(name) = value.get("event").and_then(Value::as_str) {
        return Inbound::Event {
            name: name.to_string(),
            payload: value,
        };
    }
    if value.get("return").is_some() || value.get("error").is_some() {
        return Inbound::Response(value);
    }
    Inbound::Other(value)
}

/// Unwrap a reply: an `"error"` member becomes [`ProtocolError::Command`],
/// otherwise the `"return"` member is handed back.
pub fn response_result(reply: Value) -> Result<Value> {
    if let Some(error) = reply.get("error") {
        return Err(ProtocolError::from_error_object(error));
    }
    match reply.get("return") {
        Some(value) => Ok(value.clone()),
        None => Err(ProtocolError::Unexpected(reply.to_string())),
    }
}
