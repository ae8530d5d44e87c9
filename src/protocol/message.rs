//! Protocol messages
//!
//! [`Frame`] is the decoded form of one wire message. Parsing works on the
//! frame body only; the length prefix and opcode are handled by the codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use super::handshake;
use super::ProtocolError;

/// A decoded hpfeeds message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Error report; the rest of the frame is the message
    Error(String),
    /// Broker greeting
    Info { name: String, nonce: Bytes },
    /// Client authentication
    Auth { ident: String, hash: Bytes },
    /// Message published by `ident` on `channel`
    Publish {
        ident: String,
        channel: String,
        payload: Bytes,
    },
    Subscribe { ident: String, channel: String },
    Unsubscribe { ident: String, channel: String },
}

impl Frame {
    /// Build the AUTH frame a client sends in reply to INFO
    pub fn auth(ident: impl Into<String>, nonce: &[u8], secret: &str) -> Self {
        Frame::Auth {
            ident: ident.into(),
            hash: Bytes::copy_from_slice(&handshake::auth_hash(nonce, secret)),
        }
    }

    pub fn publish(ident: impl Into<String>, channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Frame::Publish {
            ident: ident.into(),
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn subscribe(ident: impl Into<String>, channel: impl Into<String>) -> Self {
        Frame::Subscribe {
            ident: ident.into(),
            channel: channel.into(),
        }
    }

    pub fn unsubscribe(ident: impl Into<String>, channel: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            ident: ident.into(),
            channel: channel.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(message.into())
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Frame::Error(_) => OP_ERROR,
            Frame::Info { .. } => OP_INFO,
            Frame::Auth { .. } => OP_AUTH,
            Frame::Publish { .. } => OP_PUBLISH,
            Frame::Subscribe { .. } => OP_SUBSCRIBE,
            Frame::Unsubscribe { .. } => OP_UNSUBSCRIBE,
        }
    }

    /// Parse a frame body for the given opcode
    pub fn parse(opcode: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let frame = match opcode {
            OP_ERROR => Frame::Error(rest_string(body, "error")?),
            OP_INFO => Frame::Info {
                name: read_str8(&mut body, "name")?,
                nonce: body,
            },
            OP_AUTH => Frame::Auth {
                ident: read_str8(&mut body, "ident")?,
                hash: body,
            },
            OP_PUBLISH => Frame::Publish {
                ident: read_str8(&mut body, "ident")?,
                channel: read_str8(&mut body, "channel")?,
                payload: body,
            },
            OP_SUBSCRIBE => Frame::Subscribe {
                ident: read_str8(&mut body, "ident")?,
                channel: rest_string(body, "channel")?,
            },
            OP_UNSUBSCRIBE => Frame::Unsubscribe {
                ident: read_str8(&mut body, "ident")?,
                channel: rest_string(body, "channel")?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(frame)
    }

    /// Size of the encoded body, excluding the header
    pub fn body_len(&self) -> usize {
        match self {
            Frame::Error(msg) => msg.len(),
            Frame::Info { name, nonce } => 1 + name.len() + nonce.len(),
            Frame::Auth { ident, hash } => 1 + ident.len() + hash.len(),
            Frame::Publish {
                ident,
                channel,
                payload,
            } => 1 + ident.len() + 1 + channel.len() + payload.len(),
            Frame::Subscribe { ident, channel } | Frame::Unsubscribe { ident, channel } => {
                1 + ident.len() + channel.len()
            }
        }
    }

    /// Write the body into `dst`
    pub fn write_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Frame::Error(msg) => dst.put_slice(msg.as_bytes()),
            Frame::Info { name, nonce } => {
                write_str8(dst, name, "name")?;
                dst.put_slice(nonce);
            }
            Frame::Auth { ident, hash } => {
                write_str8(dst, ident, "ident")?;
                dst.put_slice(hash);
            }
            Frame::Publish {
                ident,
                channel,
                payload,
            } => {
                write_str8(dst, ident, "ident")?;
                write_str8(dst, channel, "channel")?;
                dst.put_slice(payload);
            }
            Frame::Subscribe { ident, channel } | Frame::Unsubscribe { ident, channel } => {
                write_str8(dst, ident, "ident")?;
                dst.put_slice(channel.as_bytes());
            }
        }
        Ok(())
    }
}

fn read_str8(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::Truncated(field));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated(field));
    }
    rest_string(buf.split_to(len), field)
}

fn rest_string(buf: Bytes, field: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(buf.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

fn write_str8(dst: &mut BytesMut, value: &str, field: &'static str) -> Result<(), ProtocolError> {
    let len = u8::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    dst.put_u8(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::new();
        frame.write_body(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.body_len());
        buf.freeze()
    }

    #[test]
    fn test_publish_layout() {
        let frame = Frame::publish("bob", "chan.test", Bytes::from_static(b"payload"));
        let encoded = body(&frame);

        assert_eq!(&encoded[..], b"\x03bob\x09chan.testpayload");
        assert_eq!(Frame::parse(OP_PUBLISH, encoded).unwrap(), frame);
    }

    #[test]
    fn test_subscribe_channel_runs_to_end() {
        let parsed = Frame::parse(OP_SUBSCRIBE, Bytes::from_static(b"\x05alicechan.test")).unwrap();
        assert_eq!(parsed, Frame::subscribe("alice", "chan.test"));

        let parsed = Frame::parse(OP_UNSUBSCRIBE, Bytes::from_static(b"\x05alicechan.test")).unwrap();
        assert_eq!(parsed, Frame::unsubscribe("alice", "chan.test"));
    }

    #[test]
    fn test_info_and_auth() {
        let info = Frame::parse(OP_INFO, Bytes::from_static(b"\x07hpfeeds\x01\x02\x03\x04")).unwrap();
        let Frame::Info { name, nonce } = info else {
            panic!("expected info");
        };
        assert_eq!(name, "hpfeeds");
        assert_eq!(&nonce[..], &[1, 2, 3, 4]);

        let auth = Frame::auth("alice", &nonce, "pw");
        let Frame::Auth { hash, .. } = &auth else {
            panic!("expected auth");
        };
        assert_eq!(hash.len(), HASH_SIZE);
        assert_eq!(Frame::parse(OP_AUTH, body(&auth)).unwrap(), auth);
    }

    #[test]
    fn test_error_message() {
        let parsed = Frame::parse(OP_ERROR, Bytes::from_static(b"authfail")).unwrap();
        assert_eq!(parsed, Frame::error(ERR_AUTH_FAIL));
    }

    #[test]
    fn test_truncated_fields() {
        assert!(matches!(
            Frame::parse(OP_PUBLISH, Bytes::new()),
            Err(ProtocolError::Truncated("ident"))
        ));
        assert!(matches!(
            Frame::parse(OP_PUBLISH, Bytes::from_static(b"\x03bob\x09chan")),
            Err(ProtocolError::Truncated("channel"))
        ));
        assert!(matches!(
            Frame::parse(OP_AUTH, Bytes::from_static(b"\x10short")),
            Err(ProtocolError::Truncated("ident"))
        ));
    }

    #[test]
    fn test_invalid_utf8_and_opcode() {
        assert!(matches!(
            Frame::parse(OP_SUBSCRIBE, Bytes::from_static(b"\x01a\xff\xfe")),
            Err(ProtocolError::InvalidUtf8("channel"))
        ));
        assert!(matches!(
            Frame::parse(9, Bytes::new()),
            Err(ProtocolError::UnknownOpcode(9))
        ));
    }

    #[test]
    fn test_field_too_long() {
        let frame = Frame::subscribe("x".repeat(256), "chan");
        let mut buf = BytesMut::new();
        assert!(matches!(
            frame.write_body(&mut buf),
            Err(ProtocolError::FieldTooLong { field: "ident", len: 256 })
        ));
    }
}
