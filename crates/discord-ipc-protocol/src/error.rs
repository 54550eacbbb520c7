//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is structurally invalid (bad header, length mismatch, bad JSON).
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Body could not be serialized. This is a caller bug, not a wire error.
    #[error("failed to encode frame body: {0}")]
    Encode(#[source] serde_json::Error),

    /// Serialized body does not fit in the 32-bit length field.
    #[error("frame body too large: {size} bytes")]
    FrameTooLarge { size: usize },
}

impl ProtocolError {
    /// Creates a malformed frame error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Returns true for the wire-level `MalformedFrame` kind.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedFrame { .. })
    }
}
