//! Opcodes, handshake bodies and inbound messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{DISPATCH_COMMAND, ERROR_EVENT, HANDSHAKE_VERSION};

/// Protocol-level frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Initial client hello carrying the client id.
    Handshake = 0,
    /// Regular command, response or event.
    Frame = 1,
    /// Connection is being closed.
    Close = 2,
    /// Keepalive probe, answered with [`Opcode::Pong`].
    Ping = 3,
    /// Keepalive answer.
    Pong = 4,
}

impl Opcode {
    /// Maps a raw opcode to a known one.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::Frame),
            2 => Some(Self::Close),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns the raw wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether the remote answers a frame sent with this raw opcode.
    ///
    /// `Close` and `Pong` are fire-and-forget; everything else, unknown
    /// opcodes included, is assumed to get exactly one reply.
    pub fn expects_reply(raw: u32) -> bool {
        !matches!(Self::from_u32(raw), Some(Self::Close | Self::Pong))
    }
}

impl From<Opcode> for u32 {
    fn from(opcode: Opcode) -> Self {
        opcode.as_u32()
    }
}

/// Body of the opcode 0 handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Handshake version, always [`HANDSHAKE_VERSION`].
    pub v: u32,
    /// Application client id, always sent as a string.
    pub client_id: String,
}

impl Handshake {
    /// Creates a handshake body for the given client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            v: HANDSHAKE_VERSION,
            client_id: client_id.into(),
        }
    }
}

/// Outcome of the handshake, read from the reply body.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeReply {
    /// Handshake accepted; carries the full reply.
    Accepted(Message),
    /// Handshake refused with a structured reason.
    Rejected {
        /// Error code sent by the remote.
        code: i64,
        /// Human readable reason.
        message: String,
    },
}

impl HandshakeReply {
    /// Classifies a decoded reply body.
    ///
    /// Any body carrying a `code` key is a rejection.
    pub fn from_payload(payload: Value) -> ProtocolResult<Self> {
        let message = Message::try_from(payload)?;

        let Some(code) = message.get("code") else {
            return Ok(Self::Accepted(message));
        };
        let code = code.as_i64().ok_or_else(|| {
            ProtocolError::malformed(format!("handshake error code is not an integer: {}", code))
        })?;
        let reason = message
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self::Rejected {
            code,
            message: reason,
        })
    }
}

/// A decoded inbound body. Always a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Returns a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Event discriminator (`evt`), if present and a string.
    pub fn evt(&self) -> Option<&str> {
        self.get("evt").and_then(Value::as_str)
    }

    /// Command name (`cmd`), if present and a string.
    pub fn cmd(&self) -> Option<&str> {
        self.get("cmd").and_then(Value::as_str)
    }

    /// Correlation nonce, if present and a string.
    pub fn nonce(&self) -> Option<&str> {
        self.get("nonce").and_then(Value::as_str)
    }

    /// The `data` field.
    pub fn data(&self) -> Option<&Value> {
        self.get("data")
    }

    /// True when `evt` is the reserved `"ERROR"` value.
    pub fn is_error(&self) -> bool {
        self.evt() == Some(ERROR_EVENT)
    }

    /// True for unsolicited events pushed by the remote.
    pub fn is_dispatch(&self) -> bool {
        self.cmd() == Some(DISPATCH_COMMAND)
    }

    /// `data.message` of an error event.
    pub fn error_message(&self) -> Option<&str> {
        self.data()?.get("message")?.as_str()
    }

    /// Borrows the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts back into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Message {
    type Error = ProtocolError;

    fn try_from(value: Value) -> ProtocolResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ProtocolError::malformed(format!(
                "expected a JSON object body, got {}",
                json_kind(&other)
            ))),
        }
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        message.into_value()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
