//! Message codec
//!
//! A transport frame carries one or more encoded messages. The default
//! [`MsgPackCodec`] writes each message as a 4-byte big-endian length prefix
//! followed by its MessagePack encoding.

use crate::{Message, ProtocolError};
use bytes::Bytes;

/// Maximum size of a single encoded message (16MB)
pub const MAX_UNIT_SIZE: usize = 16 * 1024 * 1024;

/// Converts between logical messages and transport frames
pub trait Codec: Send + Sync {
    /// Encode one message into a frame
    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError>;

    /// Decode every message carried by a frame, in order.
    ///
    /// Each entry is decoded independently, so one bad unit does not hide
    /// the ones after it. A frame whose framing itself is broken ends with
    /// an error entry.
    fn decode(&self, frame: &[u8]) -> Vec<Result<Message, ProtocolError>>;
}

/// Length-prefixed MessagePack codec
#[cfg(feature = "rmp-serde")]
#[derive(Debug, Clone)]
pub struct MsgPackCodec {
    /// Maximum unit size allowed
    max_unit_size: usize,
}

#[cfg(feature = "rmp-serde")]
impl Default for MsgPackCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "rmp-serde")]
impl MsgPackCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            max_unit_size: MAX_UNIT_SIZE,
        }
    }

    /// Create a new codec with a custom maximum unit size
    pub fn with_max_unit_size(max_unit_size: usize) -> Self {
        Self { max_unit_size }
    }

    /// Encode several messages into one frame
    pub fn encode_all(&self, messages: &[Message]) -> Result<Bytes, ProtocolError> {
        let mut buf = bytes::BytesMut::new();
        for message in messages {
            buf.extend_from_slice(&self.encode(message)?);
        }
        Ok(buf.freeze())
    }
}

#[cfg(feature = "rmp-serde")]
impl Codec for MsgPackCodec {
    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        use bytes::BufMut;

        let unit = rmp_serde::to_vec(message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        if unit.len() > self.max_unit_size {
            return Err(ProtocolError::FrameTooLarge {
                size: unit.len(),
                max: self.max_unit_size,
            });
        }

        let mut buf = bytes::BytesMut::with_capacity(4 + unit.len());
        buf.put_u32(unit.len() as u32);
        buf.put_slice(&unit);
        Ok(buf.freeze())
    }

    fn decode(&self, frame: &[u8]) -> Vec<Result<Message, ProtocolError>> {
        use bytes::Buf;

        let mut messages = Vec::new();
        let mut rest = frame;

        while !rest.is_empty() {
            if rest.len() < 4 {
                messages.push(Err(ProtocolError::InvalidFrame));
                break;
            }

            let unit_len = (&rest[..4]).get_u32() as usize;
            if unit_len > self.max_unit_size {
                messages.push(Err(ProtocolError::FrameTooLarge {
                    size: unit_len,
                    max: self.max_unit_size,
                }));
                break;
            }
            if rest.len() < 4 + unit_len {
                messages.push(Err(ProtocolError::InvalidFrame));
                break;
            }

            let unit = &rest[4..4 + unit_len];
            messages.push(
                rmp_serde::from_slice(unit)
                    .map_err(|e| ProtocolError::Serialization(e.to_string())),
            );
            rest = &rest[4 + unit_len..];
        }

        messages
    }
}
