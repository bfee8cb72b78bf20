//! Message connections, optionally sealed with a Noise_XX session.
//!
//! The handshake runs over plain records before any message is exchanged:
//!   initiator → responder   msg1 (ephemeral)
//!   responder → initiator   msg2 (ephemeral, static, payload)
//!   initiator → responder   msg3 (static)
//! The initiator refuses to finish unless the responder's static key is
//! the pinned daemon key.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use tether_core::crypto::{fingerprint, KeyPair, NoiseInitiator, NoiseResponder, SealedSession};

use super::frame::{decode_parts, encode_parts, record_codec, MAX_RECORD_LEN};
use super::TransportError;

/// Any bidirectional byte stream a connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

type Records = Framed<Box<dyn ByteStream>, LengthDelimitedCodec>;

/// A stream carrying whole multipart messages.
pub struct Connection {
    records: Records,
    sealed: Option<SealedSession>,
    scratch: Vec<u8>,
}

impl Connection {
    /// Plaintext connection.
    pub fn plain(stream: Box<dyn ByteStream>) -> Self {
        Self::over(Framed::new(stream, record_codec()), None)
    }

    fn over(records: Records, sealed: Option<SealedSession>) -> Self {
        Self {
            records,
            sealed,
            scratch: Vec::new(),
        }
    }

    /// Run the initiator side of the handshake, pinning the responder to
    /// `daemon_public`.
    pub async fn initiate(
        stream: Box<dyn ByteStream>,
        local: &KeyPair,
        daemon_public: [u8; 32],
    ) -> Result<Self, TransportError> {
        let mut records = Framed::new(stream, record_codec());
        let (initiator, msg1) = NoiseInitiator::new(local, daemon_public)?;
        records.send(Bytes::from(msg1)).await?;

        let msg2 = next_record(&mut records).await?;
        let (session, msg3) = initiator.finish(&msg2)?;
        records.send(Bytes::from(msg3)).await?;

        tracing::debug!(daemon = %fingerprint(&daemon_public), "secure channel established");
        Ok(Self::over(records, Some(session)))
    }

    /// Run the responder side of the handshake. Returns the connection and
    /// the initiator's static public key.
    pub async fn respond(
        stream: Box<dyn ByteStream>,
        local: &KeyPair,
    ) -> Result<(Self, [u8; 32]), TransportError> {
        let mut records = Framed::new(stream, record_codec());
        let responder = NoiseResponder::new(local)?;
        let msg1 = next_record(&mut records).await?;
        let (pending, msg2) = responder.respond(&msg1)?;
        records.send(Bytes::from(msg2)).await?;

        let msg3 = next_record(&mut records).await?;
        let (session, remote) = pending.finish(&msg3)?;

        tracing::debug!(peer = %fingerprint(&remote), "secure channel accepted");
        Ok((Self::over(records, Some(session)), remote))
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Send one multipart message. A message too large for one record
    /// fails with [`TransportError::Frame`] before anything is written.
    pub async fn send(&mut self, parts: &[Bytes]) -> Result<(), TransportError> {
        let plain = encode_parts(parts)?;
        let record = match self.sealed.as_mut() {
            Some(session) => {
                session.encrypt(&plain, &mut self.scratch)?;
                Bytes::copy_from_slice(&self.scratch)
            }
            None => plain,
        };
        if record.len() > MAX_RECORD_LEN {
            return Err(TransportError::Frame(format!(
                "record of {} bytes exceeds limit",
                record.len()
            )));
        }
        self.records.send(record).await?;
        Ok(())
    }

    /// Receive one multipart message.
    ///
    /// [`TransportError::Frame`] and [`TransportError::Crypto`] concern
    /// only the record just read; the stream stays usable.
    pub async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError> {
        let record = next_record(&mut self.records).await?;
        match self.sealed.as_mut() {
            Some(session) => {
                let mut plain = Vec::with_capacity(record.len());
                session.decrypt(&record, &mut plain)?;
                decode_parts(Bytes::from(plain))
            }
            None => decode_parts(record.freeze()),
        }
    }
}

/// Next record, or [`TransportError::Closed`] at a clean end of stream.
async fn next_record(records: &mut Records) -> Result<bytes::BytesMut, TransportError> {
    match records.next().await {
        Some(record) => Ok(record?),
        None => Err(TransportError::Closed),
    }
}
