//! Length-prefixed records and multipart framing on byte streams.
//!
//! Record:    [u32 LE length][payload]
//! Multipart: [u16 LE part count] then per part [u32 LE length][bytes]
//!
//! A plaintext connection carries one multipart message per record. A
//! sealed connection carries the sealed bytes of that same encoding.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use super::TransportError;

/// Largest record either side will accept.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Codec for the record layer. Oversized records fail as `InvalidData`.
pub fn record_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .little_endian()
        .max_frame_length(MAX_RECORD_LEN)
        .new_codec()
}

/// Encode a multipart message.
pub fn encode_parts(parts: &[Bytes]) -> Result<Bytes, TransportError> {
    if parts.len() > u16::MAX as usize {
        return Err(TransportError::Frame(format!(
            "{} parts exceed limit",
            parts.len()
        )));
    }
    let total: usize = 2 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16_le(parts.len() as u16);
    for part in parts {
        buf.put_u32_le(part.len() as u32);
        buf.put_slice(part);
    }
    Ok(buf.freeze())
}

/// Decode a multipart message. Parts share the input buffer.
pub fn decode_parts(buf: Bytes) -> Result<Vec<Bytes>, TransportError> {
    let short = || TransportError::Frame("multipart message truncated".into());

    if buf.len() < 2 {
        return Err(short());
    }
    let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let mut parts = Vec::with_capacity(count);
    let mut at = 2;
    for _ in 0..count {
        if buf.len() < at + 4 {
            return Err(short());
        }
        let len = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
        at += 4;
        if buf.len() < at + len {
            return Err(short());
        }
        parts.push(buf.slice(at..at + len));
        at += len;
    }
    if at != buf.len() {
        return Err(TransportError::Frame(format!(
            "{} trailing bytes after multipart message",
            buf.len() - at
        )));
    }
    Ok(parts)
}
