//! Socket-backed transport: TCP and Unix-domain endpoints.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;

use tether_core::crypto::KeyPair;
use tether_core::message::{EnrollmentRequest, EnrollmentResponse};
use tether_core::{wire, Envelope};

use super::secure::{ByteStream, Connection};
use super::{BroadcastChannel, Enroller, RequestChannel, Transport, TransportError};

/// First part of the frame a subscriber sends after connecting.
pub const SUBSCRIBE_COMMAND: &[u8] = b"SUBSCRIBE";

// ── Endpoints ─────────────────────────────────────────────────────────────────

/// A daemon address: `tcp://host:port` or `ipc:///path/to/socket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        let invalid = |why: &'static str| TransportError::Endpoint(address.to_string(), why);

        if let Some(rest) = address.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
            Ok(Endpoint::Tcp(rest.to_string()))
        } else if let Some(path) = address.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid("missing socket path"));
            }
            Ok(Endpoint::Ipc(PathBuf::from(path)))
        } else {
            Err(invalid("expected tcp:// or ipc:// scheme"))
        }
    }

    /// Unix-domain endpoints are reachable only from this host.
    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Ipc(_))
    }

    pub async fn connect(&self) -> Result<Box<dyn ByteStream>, TransportError> {
        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(TransportError::Endpoint(
                self.to_string(),
                "ipc endpoints need a unix platform",
            )),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

// ── Request / broadcast ───────────────────────────────────────────────────────

/// Keys used to seal channels to an enrolled daemon.
#[derive(Clone)]
pub struct ChannelKeys {
    pub local: Arc<KeyPair>,
    pub daemon_public: [u8; 32],
}

/// Transport over real sockets, sealed when keys are present.
pub struct NetTransport {
    request: Endpoint,
    broadcast: Endpoint,
    keys: Option<ChannelKeys>,
}

impl NetTransport {
    pub fn new(request: Endpoint, broadcast: Endpoint) -> Self {
        Self {
            request,
            broadcast,
            keys: None,
        }
    }

    pub fn sealed(mut self, keys: ChannelKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Connection, TransportError> {
        let stream = endpoint.connect().await?;
        match &self.keys {
            Some(keys) => Connection::initiate(stream, &keys.local, keys.daemon_public).await,
            None => Ok(Connection::plain(stream)),
        }
    }
}

pub struct NetRequest {
    conn: Connection,
}

impl RequestChannel for NetRequest {
    async fn request(&mut self, parts: Vec<Bytes>) -> Result<Vec<Bytes>, TransportError> {
        self.conn.send(&parts).await?;
        self.conn.recv().await
    }
}

pub struct NetBroadcast {
    conn: Connection,
    topic: Bytes,
}

impl BroadcastChannel for NetBroadcast {
    /// Next message on our topic. A record that fails to unseal or to
    /// split into parts is dropped; the stream itself is still aligned.
    async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError> {
        loop {
            let parts = match self.conn.recv().await {
                Ok(parts) => parts,
                Err(e @ (TransportError::Frame(_) | TransportError::Crypto(_))) => {
                    tracing::warn!(error = %e, "dropping malformed broadcast record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match parts.first() {
                Some(topic) if topic.starts_with(&self.topic) => return Ok(parts),
                _ => tracing::trace!("dropping broadcast for another topic"),
            }
        }
    }
}

impl Transport for NetTransport {
    type Request = NetRequest;
    type Broadcast = NetBroadcast;

    async fn open_request(&self) -> Result<NetRequest, TransportError> {
        let conn = self.open(&self.request).await?;
        tracing::debug!(
            endpoint = %self.request,
            sealed = conn.is_sealed(),
            "request channel open"
        );
        Ok(NetRequest { conn })
    }

    async fn open_broadcast(&self, topic: &[u8]) -> Result<NetBroadcast, TransportError> {
        let mut conn = self.open(&self.broadcast).await?;
        let topic = Bytes::copy_from_slice(topic);
        conn.send(&[Bytes::from_static(SUBSCRIBE_COMMAND), topic.clone()])
            .await?;
        tracing::debug!(
            endpoint = %self.broadcast,
            topic = %String::from_utf8_lossy(&topic),
            "subscribed"
        );
        Ok(NetBroadcast { conn, topic })
    }
}

// ── Enrollment ────────────────────────────────────────────────────────────────

/// Exchanges enrollment requests on a fresh plaintext connection per
/// attempt. The daemon's key is not known until this succeeds.
pub struct NetEnroller {
    endpoint: Endpoint,
    timeout: Duration,
}

impl NetEnroller {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(
        &self,
        request: &EnrollmentRequest,
    ) -> Result<EnrollmentResponse, TransportError> {
        let mut conn = Connection::plain(self.endpoint.connect().await?);
        let encoded = wire::encode(&Envelope::EnrollmentRequest(request.clone()));
        conn.send(&[encoded]).await?;

        let reply = conn.recv().await?;
        let body = reply
            .last()
            .ok_or_else(|| TransportError::Protocol("empty enrollment reply".into()))?;
        match wire::decode(body)? {
            Envelope::EnrollmentResponse(response) => Ok(response),
            other => Err(TransportError::Protocol(format!(
                "expected EnrollmentResponse, got {:?}",
                other.kind()
            ))),
        }
    }
}

impl Enroller for NetEnroller {
    async fn enroll(
        &mut self,
        request: &EnrollmentRequest,
    ) -> Result<EnrollmentResponse, TransportError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}
