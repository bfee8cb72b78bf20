//! Message model for the worker protocol.
//!
//! `Envelope` is the closed set of everything a worker and the daemon say
//! to each other. The binary layout lives in [`crate::wire`]; this module
//! only describes the values.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

/// Width of worker and request identifiers on the wire.
pub const ID_LEN: usize = 16;

/// Topic the daemon publishes worker traffic under.
pub const WORKER_BROADCAST_TOPIC: &[u8; 7] = b"workers";

/// Marker the echo processor puts ahead of the echoed arguments.
pub const ECHO_MARKER: &str = "echo_response";

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Identifier the daemon assigned to this worker at enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub Uuid);

/// Identifier of a single work request. Unique per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

impl WorkerId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        self.0.as_bytes()
    }

    pub fn parse(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text).map(Self)
    }
}

impl RequestId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        self.0.as_bytes()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// A tagged value carried as request arguments and results.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Integer(i64),
    Float(f64),
    Str(String),
    List(Vec<TypedValue>),
}

impl TypedValue {
    pub fn str(s: impl Into<String>) -> Self {
        TypedValue::Str(s.into())
    }

    /// Placeholder for a variant this build does not understand.
    pub fn unsupported(tag: u8) -> Self {
        TypedValue::Str(format!("<unsupported_type_{tag}>"))
    }

    /// Rebuild the tree bottom-up, letting `leaf` replace every scalar.
    /// Lists keep their shape; only scalars pass through `leaf`.
    pub fn transform<F>(&self, leaf: &mut F) -> TypedValue
    where
        F: FnMut(&TypedValue) -> TypedValue,
    {
        match self {
            TypedValue::List(items) => {
                TypedValue::List(items.iter().map(|v| v.transform(leaf)).collect())
            }
            scalar => leaf(scalar),
        }
    }

    /// Nesting depth: scalars are 0, a flat list is 1.
    pub fn depth(&self) -> usize {
        match self {
            TypedValue::List(items) => 1 + items.iter().map(|v| v.depth()).max().unwrap_or(0),
            _ => 0,
        }
    }
}

impl From<i64> for TypedValue {
    fn from(v: i64) -> Self {
        TypedValue::Integer(v)
    }
}

impl From<f64> for TypedValue {
    fn from(v: f64) -> Self {
        TypedValue::Float(v)
    }
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        TypedValue::Str(v.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(v: String) -> Self {
        TypedValue::Str(v)
    }
}

impl From<Vec<TypedValue>> for TypedValue {
    fn from(v: Vec<TypedValue>) -> Self {
        TypedValue::List(v)
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// A unit of work pushed by the daemon over the broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub request_id: RequestId,
    /// Only the worker with this identifier may process the item.
    pub destination: WorkerId,
    pub arguments: Vec<TypedValue>,
    /// Deadline hint passed through to the processor. Millisecond precision.
    pub timeout: Option<Duration>,
}

/// Sent to the enrollment endpoint to exchange a token for an identity.
#[derive(Clone, PartialEq)]
pub struct EnrollmentRequest {
    pub token: String,
    /// Worker's public key, Z85-encoded.
    pub public_key: String,
    pub service_type: String,
    pub hostname: String,
}

impl fmt::Debug for EnrollmentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentRequest")
            .field("token", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("service_type", &self.service_type)
            .field("hostname", &self.hostname)
            .finish()
    }
}

/// The enrollment endpoint's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentResponse {
    pub success: bool,
    /// Daemon's public key, Z85-encoded (success only).
    pub daemon_public_key: Option<String>,
    /// Identifier assigned to this worker (success only).
    pub identifier: Option<String>,
    /// Why enrollment was refused (failure only).
    pub error: Option<String>,
}

impl EnrollmentResponse {
    pub fn accepted(daemon_public_key: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            success: true,
            daemon_public_key: Some(daemon_public_key.into()),
            identifier: Some(identifier.into()),
            error: None,
        }
    }

    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            daemon_public_key: None,
            identifier: None,
            error: Some(error.into()),
        }
    }
}

/// Why a worker could not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkErrorKind {
    /// The caller may not run this request.
    PermissionDenied = 0x01,
    /// The arguments do not describe valid work.
    InvalidRequest = 0x02,
    /// The worker itself broke.
    InternalError = 0x03,
    /// The work did not finish within its timeout.
    RequestTimedOut = 0x04,
    /// The work ran and failed.
    RequestError = 0x05,
}

impl WorkErrorKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::PermissionDenied),
            0x02 => Some(Self::InvalidRequest),
            0x03 => Some(Self::InternalError),
            0x04 => Some(Self::RequestTimedOut),
            0x05 => Some(Self::RequestError),
            _ => None,
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Every message exchanged between a worker and the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Worker → daemon: announce readiness on the correlated channel.
    AttachWorker { worker_id: WorkerId, worker_type: String },
    /// Daemon → workers: liveness check.
    Ping,
    /// Worker → daemon: answer to `Ping`.
    Pong { worker_id: WorkerId, worker_type: String },
    /// Daemon → workers: work for one destination.
    WorkRequest(WorkItem),
    /// Worker → daemon: the processor's result.
    WorkResult {
        worker_id: WorkerId,
        request_id: RequestId,
        result: TypedValue,
    },
    /// Worker → daemon: the processor failed for this request.
    WorkError {
        worker_id: WorkerId,
        request_id: RequestId,
        kind: WorkErrorKind,
        message: String,
    },
    /// Daemon → workers: stop. `None` addresses everyone.
    Terminate { target: Option<WorkerId> },
    EnrollmentRequest(EnrollmentRequest),
    EnrollmentResponse(EnrollmentResponse),
    /// Daemon → worker: attach accepted.
    Attached,
    /// Daemon → worker: attach refused.
    Rejected { reason: String },
    /// Daemon → worker: attach refused for credential reasons.
    AuthFailed { reason: String },
    /// Daemon → worker: generic acknowledgement on the correlated channel.
    Ack,
}

/// Wire tag of each envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    AttachWorker = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    WorkRequest = 0x04,
    WorkResult = 0x05,
    WorkError = 0x06,
    Terminate = 0x07,
    EnrollmentRequest = 0x08,
    EnrollmentResponse = 0x09,
    Attached = 0x0a,
    Rejected = 0x0b,
    AuthFailed = 0x0c,
    Ack = 0x0d,
}

impl EnvelopeKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::AttachWorker),
            0x02 => Some(Self::Ping),
            0x03 => Some(Self::Pong),
            0x04 => Some(Self::WorkRequest),
            0x05 => Some(Self::WorkResult),
            0x06 => Some(Self::WorkError),
            0x07 => Some(Self::Terminate),
            0x08 => Some(Self::EnrollmentRequest),
            0x09 => Some(Self::EnrollmentResponse),
            0x0a => Some(Self::Attached),
            0x0b => Some(Self::Rejected),
            0x0c => Some(Self::AuthFailed),
            0x0d => Some(Self::Ack),
            _ => None,
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::AttachWorker { .. } => EnvelopeKind::AttachWorker,
            Envelope::Ping => EnvelopeKind::Ping,
            Envelope::Pong { .. } => EnvelopeKind::Pong,
            Envelope::WorkRequest(_) => EnvelopeKind::WorkRequest,
            Envelope::WorkResult { .. } => EnvelopeKind::WorkResult,
            Envelope::WorkError { .. } => EnvelopeKind::WorkError,
            Envelope::Terminate { .. } => EnvelopeKind::Terminate,
            Envelope::EnrollmentRequest(_) => EnvelopeKind::EnrollmentRequest,
            Envelope::EnrollmentResponse(_) => EnvelopeKind::EnrollmentResponse,
            Envelope::Attached => EnvelopeKind::Attached,
            Envelope::Rejected { .. } => EnvelopeKind::Rejected,
            Envelope::AuthFailed { .. } => EnvelopeKind::AuthFailed,
            Envelope::Ack => EnvelopeKind::Ack,
        }
    }
}
