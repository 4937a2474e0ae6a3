//! Stream framing for keyrelay.
//!
//! Every QUIC stream carries TLV (Type-Length-Value) frames. A `MESSAGE`
//! frame wraps exactly one serialized protocol message; a `CLOSE` frame
//! carries the reason the sender is about to finish the stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame type constants.
const FRAME_MESSAGE: u8 = 0x01;
const FRAME_CLOSE: u8 = 0x02;

/// Maximum varint size in bytes (for u64).
const MAX_VARINT_SIZE: usize = 10;

/// Largest payload accepted in a single frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid frame type: {0:#x}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("varint overflow")]
    VarintOverflow,

    #[error("incomplete data")]
    IncompleteData,

    #[error("invalid utf-8 in reason string")]
    InvalidUtf8,

    #[error("empty message")]
    EmptyMessage,

    #[error("invalid message tag: {0:#x}")]
    InvalidMessageTag(u8),

    #[error("invalid identity size: {0} bytes")]
    InvalidIdentitySize(usize),

    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One serialized protocol message.
    Message(Bytes),
    /// The sender is closing the stream.
    Close { reason: String },
}

/// Encode a u64 value as a varint.
///
/// Uses MSB as continuation flag, lower 7 bits for data.
pub fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from a buffer.
///
/// Returns `Ok(None)` if there isn't enough data.
/// Returns `Err(VarintOverflow)` if the varint is too large.
pub fn decode_varint(buf: &mut &[u8]) -> ProtocolResult<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;

    for i in 0..MAX_VARINT_SIZE {
        if buf.is_empty() {
            return Ok(None);
        }

        let byte = buf[0];
        *buf = &buf[1..];

        let value = (byte & 0x7F) as u64;

        if shift >= 64 || (shift == 63 && value > 1) {
            return Err(ProtocolError::VarintOverflow);
        }

        result |= value << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok(Some(result));
        }

        if i == MAX_VARINT_SIZE - 1 {
            return Err(ProtocolError::VarintOverflow);
        }
    }

    Err(ProtocolError::VarintOverflow)
}

impl Frame {
    /// Encode this frame to a byte buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Message(payload) => {
                buf.put_u8(FRAME_MESSAGE);
                encode_varint(payload.len() as u64, buf);
                buf.put_slice(payload);
            }
            Frame::Close { reason } => {
                buf.put_u8(FRAME_CLOSE);
                let reason_bytes = reason.as_bytes();
                encode_varint(reason_bytes.len() as u64, buf);
                buf.put_slice(reason_bytes);
            }
        }
    }

    /// Encode this frame into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a frame from a byte buffer.
    ///
    /// Returns `Ok(None)` if there isn't enough data to decode a complete frame.
    /// On success, returns the decoded frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Option<(Frame, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let frame_type = buf[0];
        if frame_type != FRAME_MESSAGE && frame_type != FRAME_CLOSE {
            return Err(ProtocolError::InvalidFrameType(frame_type));
        }

        let mut remaining = &buf[1..];
        let start_len = remaining.len();

        let length = match decode_varint(&mut remaining)? {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        let header_size = 1 + (start_len - remaining.len());

        if remaining.len() < length {
            return Ok(None);
        }

        let payload = &remaining[..length];
        let frame = match frame_type {
            FRAME_MESSAGE => Frame::Message(Bytes::copy_from_slice(payload)),
            _ => {
                let reason = std::str::from_utf8(payload)
                    .map_err(|_| ProtocolError::InvalidUtf8)?
                    .to_string();
                Frame::Close { reason }
            }
        };

        Ok(Some((frame, header_size + length)))
    }
}
