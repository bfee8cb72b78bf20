//! Channels between a worker and its daemon.
//!
//! The session and enrollment logic only see these traits. `net` provides
//! the socket implementation used by the binary and the integration tests.

pub mod frame;
pub mod net;
pub mod secure;

use bytes::Bytes;

use tether_core::crypto::CryptoError;
use tether_core::message::{EnrollmentRequest, EnrollmentResponse};
use tether_core::wire::CodecError;

pub use net::{ChannelKeys, Endpoint, NetEnroller, NetTransport};
pub use secure::Connection;

/// Correlated request/reply channel. Exactly one reply per request.
///
/// Taking `&mut self` keeps at most one request outstanding.
#[allow(async_fn_in_trait)]
pub trait RequestChannel {
    async fn request(&mut self, parts: Vec<Bytes>) -> Result<Vec<Bytes>, TransportError>;
}

/// Subscription to daemon broadcasts. Each message is `[topic, payload..]`.
#[allow(async_fn_in_trait)]
pub trait BroadcastChannel {
    async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError>;
}

/// Opens the two channels a session needs.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Request: RequestChannel;
    type Broadcast: BroadcastChannel;

    async fn open_request(&self) -> Result<Self::Request, TransportError>;
    async fn open_broadcast(&self, topic: &[u8]) -> Result<Self::Broadcast, TransportError>;
}

/// One enrollment exchange with the daemon.
#[allow(async_fn_in_trait)]
pub trait Enroller {
    async fn enroll(
        &mut self,
        request: &EnrollmentRequest,
    ) -> Result<EnrollmentResponse, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid endpoint {0:?}: {1}")]
    Endpoint(String, &'static str),

    #[error("framing error: {0}")]
    Frame(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("secure channel failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("undecodable message: {0}")]
    Codec(#[from] CodecError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timed out waiting for the daemon")]
    Timeout,
}
