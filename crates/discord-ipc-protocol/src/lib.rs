//! Frame codec and message types for the Discord local IPC protocol.
//!
//! The desktop client listens on a Unix domain socket (or a Windows named
//! pipe) and exchanges JSON bodies wrapped in a small binary header.
//!
//! # Protocol Overview
//!
//! Every frame is an 8-byte little-endian header followed by the body:
//! - 4 bytes: opcode (u32, little-endian)
//! - 4 bytes: body length (u32, little-endian)
//! - N bytes: UTF-8 JSON body
//!
//! The reply to the handshake is the one exception: its header fields are
//! read as signed integers (see [`HandshakeHeader`]).
//!
//! # Example
//!
//! ```rust
//! use discord_ipc_protocol::{Frame, Handshake, Opcode, encode_frame};
//!
//! let bytes = encode_frame(Opcode::Handshake, &Handshake::new("123")).unwrap();
//! let frame = Frame::decode(&bytes).unwrap();
//! assert_eq!(frame.opcode, 0);
//! assert_eq!(frame.payload["client_id"], "123");
//! ```

mod error;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{Frame, FrameHeader, HandshakeHeader, decode_body, decode_frame, encode_frame};
pub use types::{Handshake, HandshakeReply, Message, Opcode};

/// Size of every frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Handshake protocol version sent in the `v` field.
pub const HANDSHAKE_VERSION: u32 = 1;

/// Largest inbound body the decoder accepts (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// `evt` value reserved for server-side errors.
pub const ERROR_EVENT: &str = "ERROR";

/// `cmd` value carried by unsolicited events.
pub const DISPATCH_COMMAND: &str = "DISPATCH";
