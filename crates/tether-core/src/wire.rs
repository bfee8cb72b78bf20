//! tether wire format: binary encoding of every [`Envelope`].
//!
//! Every envelope is an 8-byte [`EnvelopeHeader`] followed by a body of
//! length-prefixed fields. Changing anything here is a breaking change for
//! every daemon that speaks to us.
//!
//! Body field encodings:
//!   string   u32 LE length, UTF-8 bytes
//!   id       u8 length (always 16), raw bytes
//!   option   u8 presence flag (0 or 1), then the value if present
//!   value    u8 variant tag, u32 LE payload length, payload
//!
//! A WorkError body carries a u8 failure kind between the ids and the
//! message.
//!
//! Value payloads: Integer is i64 LE, Float is f64 LE, Str is UTF-8,
//! List is a u32 LE count followed by that many values. The payload
//! length lets a decoder skip variants it does not know; those decode to
//! a placeholder string instead of failing the envelope.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use uuid::Uuid;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::message::{
    EnrollmentRequest, EnrollmentResponse, Envelope, EnvelopeKind, RequestId, TypedValue,
    WorkErrorKind, WorkItem, WorkerId, ID_LEN,
};

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed prefix of every envelope.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EnvelopeHeader {
    /// Always [`MAGIC`].
    pub magic: [u8; 2],
    /// Wire format version. Currently [`WIRE_VERSION`].
    pub version: u8,
    /// [`EnvelopeKind`] discriminant.
    pub kind: u8,
    /// Body length in bytes, little-endian, not including this header.
    pub body_len: [u8; 4],
}

assert_eq_size!(EnvelopeHeader, [u8; 8]);

pub const MAGIC: [u8; 2] = *b"TW";
pub const WIRE_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = std::mem::size_of::<EnvelopeHeader>();

/// Deepest list nesting a decoder will follow.
pub const MAX_VALUE_DEPTH: usize = 64;

const VALUE_INTEGER: u8 = 0x01;
const VALUE_FLOAT: u8 = 0x02;
const VALUE_STR: u8 = 0x03;
const VALUE_LIST: u8 = 0x04;

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode an envelope into a self-describing buffer.
pub fn encode(envelope: &Envelope) -> Bytes {
    let mut body = BytesMut::with_capacity(64);
    match envelope {
        Envelope::AttachWorker {
            worker_id,
            worker_type,
        }
        | Envelope::Pong {
            worker_id,
            worker_type,
        } => {
            put_id(&mut body, worker_id.as_bytes());
            put_str(&mut body, worker_type);
        }
        Envelope::Ping | Envelope::Attached | Envelope::Ack => {}
        Envelope::WorkRequest(item) => {
            put_id(&mut body, item.request_id.as_bytes());
            put_id(&mut body, item.destination.as_bytes());
            put_len(&mut body, item.arguments.len());
            for arg in &item.arguments {
                put_value(&mut body, arg);
            }
            match item.timeout {
                Some(t) => {
                    body.put_u8(1);
                    body.put_u64_le(t.as_millis().min(u64::MAX as u128) as u64);
                }
                None => body.put_u8(0),
            }
        }
        Envelope::WorkResult {
            worker_id,
            request_id,
            result,
        } => {
            put_id(&mut body, worker_id.as_bytes());
            put_id(&mut body, request_id.as_bytes());
            put_value(&mut body, result);
        }
        Envelope::WorkError {
            worker_id,
            request_id,
            kind,
            message,
        } => {
            put_id(&mut body, worker_id.as_bytes());
            put_id(&mut body, request_id.as_bytes());
            body.put_u8(*kind as u8);
            put_str(&mut body, message);
        }
        Envelope::Terminate { target } => match target {
            Some(id) => {
                body.put_u8(1);
                put_id(&mut body, id.as_bytes());
            }
            None => body.put_u8(0),
        },
        Envelope::EnrollmentRequest(req) => {
            put_str(&mut body, &req.token);
            put_str(&mut body, &req.public_key);
            put_str(&mut body, &req.service_type);
            put_str(&mut body, &req.hostname);
        }
        Envelope::EnrollmentResponse(resp) => {
            body.put_u8(resp.success as u8);
            put_opt_str(&mut body, resp.daemon_public_key.as_deref());
            put_opt_str(&mut body, resp.identifier.as_deref());
            put_opt_str(&mut body, resp.error.as_deref());
        }
        Envelope::Rejected { reason } | Envelope::AuthFailed { reason } => {
            put_str(&mut body, reason);
        }
    }

    let header = EnvelopeHeader {
        magic: MAGIC,
        version: WIRE_VERSION,
        kind: envelope.kind() as u8,
        body_len: (body.len() as u32).to_le_bytes(),
    };
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_slice(header.as_bytes());
    out.put_slice(&body);
    out.freeze()
}

fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u32_le(len as u32);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_len(buf, s.len());
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_id(buf: &mut BytesMut, id: &[u8; ID_LEN]) {
    buf.put_u8(ID_LEN as u8);
    buf.put_slice(id);
}

fn put_value(buf: &mut BytesMut, value: &TypedValue) {
    let tag = match value {
        TypedValue::Integer(_) => VALUE_INTEGER,
        TypedValue::Float(_) => VALUE_FLOAT,
        TypedValue::Str(_) => VALUE_STR,
        TypedValue::List(_) => VALUE_LIST,
    };
    buf.put_u8(tag);

    // Length is patched in once the payload is written.
    let len_at = buf.len();
    buf.put_u32_le(0);
    let start = buf.len();

    match value {
        TypedValue::Integer(i) => buf.put_i64_le(*i),
        TypedValue::Float(f) => buf.put_f64_le(*f),
        TypedValue::Str(s) => buf.put_slice(s.as_bytes()),
        TypedValue::List(items) => {
            put_len(buf, items.len());
            for item in items {
                put_value(buf, item);
            }
        }
    }

    let payload_len = (buf.len() - start) as u32;
    buf[len_at..len_at + 4].copy_from_slice(&payload_len.to_le_bytes());
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decode one envelope. The buffer must hold exactly one envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let header = EnvelopeHeader::read_from_prefix(bytes).ok_or(CodecError::Truncated {
        needed: HEADER_LEN,
        available: bytes.len(),
    })?;
    if header.magic != MAGIC {
        return Err(CodecError::BadMagic(header.magic));
    }
    if header.version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(header.version));
    }
    let kind = EnvelopeKind::from_u8(header.kind).ok_or(CodecError::UnknownKind(header.kind))?;

    let body_len = u32::from_le_bytes(header.body_len) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() < body_len {
        return Err(CodecError::Truncated {
            needed: body_len,
            available: body.len(),
        });
    }
    if body.len() > body_len {
        return Err(CodecError::TrailingBytes(body.len() - body_len));
    }

    let mut r = Reader { buf: body };
    let envelope = match kind {
        EnvelopeKind::AttachWorker => Envelope::AttachWorker {
            worker_id: WorkerId(r.id()?),
            worker_type: r.string()?,
        },
        EnvelopeKind::Ping => Envelope::Ping,
        EnvelopeKind::Pong => Envelope::Pong {
            worker_id: WorkerId(r.id()?),
            worker_type: r.string()?,
        },
        EnvelopeKind::WorkRequest => {
            let request_id = RequestId(r.id()?);
            let destination = WorkerId(r.id()?);
            let count = r.u32()? as usize;
            let mut arguments = Vec::with_capacity(count.min(r.buf.len()));
            for _ in 0..count {
                arguments.push(r.value(0)?);
            }
            let timeout = if r.flag()? {
                Some(Duration::from_millis(r.u64()?))
            } else {
                None
            };
            Envelope::WorkRequest(WorkItem {
                request_id,
                destination,
                arguments,
                timeout,
            })
        }
        EnvelopeKind::WorkResult => Envelope::WorkResult {
            worker_id: WorkerId(r.id()?),
            request_id: RequestId(r.id()?),
            result: r.value(0)?,
        },
        EnvelopeKind::WorkError => Envelope::WorkError {
            worker_id: WorkerId(r.id()?),
            request_id: RequestId(r.id()?),
            kind: {
                let tag = r.u8()?;
                WorkErrorKind::from_u8(tag).ok_or(CodecError::UnknownErrorKind(tag))?
            },
            message: r.string()?,
        },
        EnvelopeKind::Terminate => Envelope::Terminate {
            target: if r.flag()? {
                Some(WorkerId(r.id()?))
            } else {
                None
            },
        },
        EnvelopeKind::EnrollmentRequest => Envelope::EnrollmentRequest(EnrollmentRequest {
            token: r.string()?,
            public_key: r.string()?,
            service_type: r.string()?,
            hostname: r.string()?,
        }),
        EnvelopeKind::EnrollmentResponse => Envelope::EnrollmentResponse(EnrollmentResponse {
            success: r.flag()?,
            daemon_public_key: r.opt_string()?,
            identifier: r.opt_string()?,
            error: r.opt_string()?,
        }),
        EnvelopeKind::Attached => Envelope::Attached,
        EnvelopeKind::Rejected => Envelope::Rejected {
            reason: r.string()?,
        },
        EnvelopeKind::AuthFailed => Envelope::AuthFailed {
            reason: r.string()?,
        },
        EnvelopeKind::Ack => Envelope::Ack,
    };

    if !r.buf.is_empty() {
        return Err(CodecError::TrailingBytes(r.buf.len()));
    }
    Ok(envelope)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn flag(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidFlag(other)),
        }
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn opt_string(&mut self) -> Result<Option<String>, CodecError> {
        if self.flag()? {
            self.string().map(Some)
        } else {
            Ok(None)
        }
    }

    fn id(&mut self) -> Result<Uuid, CodecError> {
        let width = self.u8()? as usize;
        if width != ID_LEN {
            return Err(CodecError::MalformedId(width));
        }
        let raw = self.take(ID_LEN)?;
        Uuid::from_slice(raw).map_err(|_| CodecError::MalformedId(raw.len()))
    }

    fn value(&mut self, depth: usize) -> Result<TypedValue, CodecError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(CodecError::TooDeep);
        }
        let tag = self.u8()?;
        let len = self.u32()? as usize;
        let mut payload = Reader {
            buf: self.take(len)?,
        };

        let value = match tag {
            VALUE_INTEGER => {
                let mut b = [0u8; 8];
                b.copy_from_slice(payload.take(8)?);
                TypedValue::Integer(i64::from_le_bytes(b))
            }
            VALUE_FLOAT => {
                let mut b = [0u8; 8];
                b.copy_from_slice(payload.take(8)?);
                TypedValue::Float(f64::from_le_bytes(b))
            }
            VALUE_STR => {
                let raw = payload.take(len)?;
                let text = String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
                TypedValue::Str(text)
            }
            VALUE_LIST => {
                let count = payload.u32()? as usize;
                let mut items = Vec::with_capacity(count.min(payload.buf.len()));
                for _ in 0..count {
                    items.push(payload.value(depth + 1)?);
                }
                TypedValue::List(items)
            }
            unknown => {
                tracing::debug!(tag = unknown, len, "skipping unsupported value variant");
                return Ok(TypedValue::unsupported(unknown));
            }
        };

        if !payload.buf.is_empty() {
            return Err(CodecError::TrailingBytes(payload.buf.len()));
        }
        Ok(value)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("buffer truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("bad magic bytes: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unsupported wire version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("unknown envelope kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown work error kind: 0x{0:02x}")]
    UnknownErrorKind(u8),

    #[error("identifier must be {ID_LEN} bytes, got {0}")]
    MalformedId(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid presence flag: 0x{0:02x}")]
    InvalidFlag(u8),

    #[error("value nesting exceeds {MAX_VALUE_DEPTH} levels")]
    TooDeep,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
