//! Frame codec
//!
//! `tokio_util` codec that turns a byte stream into [`Frame`]s and back.
//! Oversized frames are rejected from the header alone, before their body is
//! buffered.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::constants::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};
use super::message::Frame;
use super::ProtocolError;

/// Length-prefixed hpfeeds frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a codec that rejects frames longer than `max` bytes (header included)
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            max_frame_size: max.max(HEADER_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = declared as usize;
        if len < HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort(declared));
        }
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        frame.advance(4);
        let opcode = frame.get_u8();
        Frame::parse(opcode, frame.freeze()).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = HEADER_SIZE + frame.body_len();
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        dst.reserve(len);
        dst.put_u32(len as u32);
        dst.put_u8(frame.opcode());
        frame.write_body(dst)
    }
}
