//! hpfeeds wire protocol
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! +----------------+--------+---------------------------+
//! | length: u32 BE | op: u8 | body (length - 5 bytes)   |
//! +----------------+--------+---------------------------+
//! ```
//!
//! `length` includes the 5-byte header. String fields inside the body are
//! either `str8` (one length byte followed by UTF-8) or run to the end of the
//! frame.

pub mod codec;
pub mod constants;
pub mod handshake;
pub mod message;

pub use codec::FrameCodec;
pub use message::Frame;

/// Wire protocol violations
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Declared length is smaller than the header
    #[error("frame length {0} shorter than header")]
    FrameTooShort(u32),

    /// Declared length exceeds the configured maximum
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    /// A field ran past the end of the frame
    #[error("truncated {0} field")]
    Truncated(&'static str),

    #[error("{0} field is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// A `str8` field longer than 255 bytes cannot be encoded
    #[error("{field} field too long ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
