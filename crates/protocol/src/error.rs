//! Protocol error types

use thiserror::Error;

/// Control-protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The emulator rejected a command
    #[error("command rejected ({class}): {desc}")]
    Command {
        /// Error class reported by the emulator
        class: String,
        /// Human-readable description
        desc: String,
    },

    /// The peer closed the connection, or a read produced no usable line.
    /// Fatal for the current connection, not for the process: the next
    /// command reconnects.
    #[error("control connection closed")]
    Eof,

    /// The greeting line was not what a healthy emulator sends
    #[error("unexpected greeting: {0}")]
    Greeting(String),

    /// A reply had a shape the protocol does not allow
    #[error("unexpected reply: {0}")]
    Unexpected(String),

    /// I/O error on the control socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line failed to decode as JSON
    #[error("malformed line: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Build a [`ProtocolError::Command`] from a reply's `"error"` member.
    pub(crate) fn from_error_object(error: &serde_json::Value) -> Self {
        let field = |name: &str| {
            error
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };
        ProtocolError::Command {
            class: field("class"),
            desc: field("desc"),
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_error_from_reply() {
        let err = ProtocolError::from_error_object(&json!({
            "class": "DeviceNotFound",
            "desc": "Device 'usb-3-7' not found"
        }));
        let msg = format!("{}", err);
        assert!(msg.contains("DeviceNotFound"));
        assert!(msg.contains("usb-3-7"));
    }

    #[test]
    fn test_command_error_tolerates_missing_fields() {
        let err = ProtocolError::from_error_object(&json!({}));
        assert!(matches!(
            err,
            ProtocolError::Command { ref class, ref desc } if class == "unknown" && desc == "unknown"
        ));
    }
}
