//! Binary frame encoding and decoding.
//!
//! Frames carry an 8-byte little-endian header followed by the JSON body:
//!
//! ```text
//! +---------------+---------------+------------------+
//! | opcode (4 LE) | length (4 LE) |  JSON body       |
//! +---------------+---------------+------------------+
//! ```

use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{Message, Opcode};
use crate::{HEADER_SIZE, MAX_FRAME_SIZE};

/// Header of a regular frame, both fields unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw opcode.
    pub opcode: u32,
    /// Body length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Creates a header.
    pub fn new(opcode: u32, length: u32) -> Self {
        Self { opcode, length }
    }

    /// Serializes the header to its wire form.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Parses a header from exactly [`HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> ProtocolResult<Self> {
        let [a, b, c, d, e, f, g, h] = header_array(bytes)?;
        Ok(Self {
            opcode: u32::from_le_bytes([a, b, c, d]),
            length: u32::from_le_bytes([e, f, g, h]),
        })
    }

    /// Returns the body length as a buffer size, rejecting oversized frames.
    pub fn body_len(&self) -> ProtocolResult<usize> {
        if self.length > MAX_FRAME_SIZE {
            return Err(ProtocolError::malformed(format!(
                "body length {} exceeds maximum of {}",
                self.length, MAX_FRAME_SIZE
            )));
        }
        Ok(self.length as usize)
    }
}

/// Header of the handshake reply.
///
/// The reply header is read as two signed integers, unlike every later frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Status or opcode field.
    pub code: i32,
    /// Body length in bytes.
    pub length: i32,
}

impl HandshakeHeader {
    /// Parses a handshake reply header from exactly [`HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> ProtocolResult<Self> {
        let [a, b, c, d, e, f, g, h] = header_array(bytes)?;
        Ok(Self {
            code: i32::from_le_bytes([a, b, c, d]),
            length: i32::from_le_bytes([e, f, g, h]),
        })
    }

    /// Returns the body length, rejecting negative or oversized values.
    pub fn body_len(&self) -> ProtocolResult<usize> {
        let length = u32::try_from(self.length).map_err(|_| {
            ProtocolError::malformed(format!("negative handshake body length {}", self.length))
        })?;
        FrameHeader::new(0, length).body_len()
    }
}

fn header_array(bytes: &[u8]) -> ProtocolResult<[u8; HEADER_SIZE]> {
    bytes.try_into().map_err(|_| {
        ProtocolError::malformed(format!(
            "header must be {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        ))
    })
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Raw opcode from the header.
    pub opcode: u32,
    /// Decoded JSON body.
    pub payload: Value,
}

impl Frame {
    /// Decodes a frame from a parsed header and its body bytes.
    pub fn from_parts(header: FrameHeader, body: &[u8]) -> ProtocolResult<Self> {
        let expected = header.body_len()?;
        if body.len() != expected {
            return Err(ProtocolError::malformed(format!(
                "header announces {} body bytes, got {}",
                expected,
                body.len()
            )));
        }

        Ok(Self {
            opcode: header.opcode,
            payload: decode_body(body)?,
        })
    }

    /// Decodes a complete frame (header followed by body).
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "frame shorter than its {}-byte header",
                HEADER_SIZE
            )));
        }
        let (header, body) = bytes.split_at(HEADER_SIZE);
        decode_frame(header, body)
    }

    /// Returns the named opcode, if the raw value is a known one.
    pub fn known_opcode(&self) -> Option<Opcode> {
        Opcode::from_u32(self.opcode)
    }

    /// Converts the body into a [`Message`].
    pub fn into_message(self) -> ProtocolResult<Message> {
        Message::try_from(self.payload)
    }
}

/// Encodes a body as a complete frame ready for a single write.
///
/// # Example
///
/// ```rust
/// use discord_ipc_protocol::{FrameHeader, Opcode, encode_frame};
///
/// let bytes = encode_frame(Opcode::Frame, &serde_json::json!({"cmd": "SUBSCRIBE"})).unwrap();
/// let header = FrameHeader::parse(&bytes[..8]).unwrap();
/// assert_eq!(header.opcode, 1);
/// assert_eq!(header.length as usize, bytes.len() - 8);
/// ```
pub fn encode_frame<T: Serialize + ?Sized>(
    opcode: impl Into<u32>,
    body: &T,
) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(body).map_err(ProtocolError::Encode)?;
    let length =
        u32::try_from(json.len()).map_err(|_| ProtocolError::FrameTooLarge { size: json.len() })?;

    let mut buffer = Vec::with_capacity(HEADER_SIZE + json.len());
    buffer.extend_from_slice(&FrameHeader::new(opcode.into(), length).to_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes a frame from its 8 header bytes and its body bytes.
pub fn decode_frame(header: &[u8], body: &[u8]) -> ProtocolResult<Frame> {
    Frame::from_parts(FrameHeader::parse(header)?, body)
}

/// Parses a frame body as JSON.
pub fn decode_body(body: &[u8]) -> ProtocolResult<Value> {
    serde_json::from_slice(body)
        .map_err(|e| ProtocolError::malformed(format!("invalid JSON body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handshake;
    use serde_json::json;

    #[test]
    fn encode_decode_roundtrip() {
        let body = json!({"cmd": "SET_ACTIVITY", "args": {"pid": 42}, "nonce": "n-1"});
        let bytes = encode_frame(Opcode::Frame, &body).unwrap();

        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.opcode, 1);
        assert_eq!(frame.payload, body);
        assert_eq!(frame.known_opcode(), Some(Opcode::Frame));
    }

    #[test]
    fn header_matches_body_length() {
        let body = json!({"text": "héllo wörld"});
        let bytes = encode_frame(7u32, &body).unwrap();

        let opcode = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(opcode, 7);
        assert_eq!(length as usize, bytes.len() - HEADER_SIZE);
    }

    #[test]
    fn handshake_body_on_the_wire() {
        let bytes = encode_frame(Opcode::Handshake, &Handshake::new("123")).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        let body = std::str::from_utf8(&bytes[HEADER_SIZE..]).unwrap();
        insta::assert_snapshot!(body, @r#"{"v":1,"client_id":"123"}"#);
    }

    #[test]
    fn unknown_opcode_passes_through() {
        let bytes = encode_frame(99u32, &json!({})).unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.opcode, 99);
        assert_eq!(frame.known_opcode(), None);
    }

    #[test]
    fn decode_rejects_short_header() {
        let result = decode_frame(&[1, 0, 0, 0, 2], b"{}");
        assert!(matches!(result, Err(ProtocolError::MalformedFrame { .. })));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let header = FrameHeader::new(1, 10).to_bytes();
        let result = decode_frame(&header, b"{}");
        assert!(result.unwrap_err().is_malformed());
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let body = b"{not json";
        let header = FrameHeader::new(1, body.len() as u32).to_bytes();
        let result = decode_frame(&header, body);
        assert!(result.unwrap_err().is_malformed());
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let header = FrameHeader::new(1, MAX_FRAME_SIZE + 1);
        assert!(header.body_len().unwrap_err().is_malformed());
    }

    #[test]
    fn handshake_header_is_signed() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&(-1i32).to_le_bytes());
        bytes[4..].copy_from_slice(&12i32.to_le_bytes());

        let header = HandshakeHeader::parse(&bytes).unwrap();
        assert_eq!(header.code, -1);
        assert_eq!(header.body_len().unwrap(), 12);

        let unsigned = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(unsigned.opcode, u32::MAX);
    }

    #[test]
    fn handshake_header_rejects_negative_length() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[4..].copy_from_slice(&(-5i32).to_le_bytes());

        let header = HandshakeHeader::parse(&bytes).unwrap();
        assert!(header.body_len().unwrap_err().is_malformed());
    }

    #[test]
    fn encode_rejects_unserializable_body() {
        use std::collections::BTreeMap;

        let mut map = BTreeMap::new();
        map.insert((1, 2), "tuple keys are not valid JSON object keys");

        let result = encode_frame(Opcode::Frame, &map);
        assert!(matches!(result, Err(ProtocolError::Encode(_))));
    }
}
