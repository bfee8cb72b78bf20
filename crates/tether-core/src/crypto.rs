//! Cryptographic primitives for tether.
//!
//! Provides three things:
//!   1. X25519 keypairs with a fixed-length Z85 text encoding (40 chars per key)
//!   2. Public key fingerprints (BLAKE3) for logs
//!   3. Noise_XX channel establishment with the daemon's static key pinned
//!
//! Keypairs are managed via x25519-dalek for explicit key control.
//! snow drives the Noise_XX state machine using those keys.
//!
//! All secret key material is zeroized when dropped.
//! There is no unsafe code in this module.

use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a Z85-encoded 32-byte key.
pub const KEY_ENCODED_LEN: usize = 40;

// ── Z85 ───────────────────────────────────────────────────────────────────────

/// Decode a 40-character Z85 key into its 32 raw bytes.
pub fn decode_key(text: &str) -> Result<[u8; 32], CryptoError> {
    if text.len() != KEY_ENCODED_LEN {
        return Err(CryptoError::KeyLength(text.len()));
    }
    let raw = z85::decode(text).map_err(|e| CryptoError::Z85(e.to_string()))?;
    raw.try_into().map_err(|v: Vec<u8>| CryptoError::KeyLength(v.len()))
}

// ── Fingerprints ──────────────────────────────────────────────────────────────

/// Short, log-safe fingerprint of a public key: the first 8 bytes of its
/// BLAKE3 digest, hex-encoded.
pub fn fingerprint(public: &[u8; 32]) -> String {
    hex::encode(&blake3::hash(public).as_bytes()[..8])
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// The Noise protocol pattern used for sealed channels.
///
/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// A worker's long-term X25519 keypair.
///
/// Generated once per storage scope and persisted by the key store.
/// The secret half never leaves this struct except through
/// [`KeyPair::secret_z85`], which hands back a zeroizing buffer.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    secret: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl KeyPair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored secret bytes.
    /// The public key is derived deterministically from the secret.
    pub fn from_secret(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self {
            secret: Zeroizing::new(secret_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Rebuild a keypair from its two Z85 halves, checking that the public
    /// half really belongs to the secret half.
    pub fn from_z85(secret: &str, public: &str) -> Result<Self, CryptoError> {
        let secret_bytes = Zeroizing::new(decode_key(secret)?);
        let public_bytes = decode_key(public)?;
        let pair = Self::from_secret(*secret_bytes);
        if pair.public != public_bytes {
            return Err(CryptoError::KeyMismatch);
        }
        Ok(pair)
    }

    pub fn secret_z85(&self) -> Zeroizing<String> {
        Zeroizing::new(z85::encode(&*self.secret))
    }

    pub fn public_z85(&self) -> String {
        z85::encode(self.public)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

/// Handshake messages are small; this bounds every buffer we hand to snow.
const HANDSHAKE_BUF: usize = 256;

/// Initiator side of the Noise_XX handshake (the worker).
///
/// Sends message 1, reads message 2, checks the responder's static key
/// against the pinned daemon key, and writes message 3.
pub struct NoiseInitiator {
    state: HandshakeState,
    expected_remote: [u8; 32],
}

impl NoiseInitiator {
    /// Begin a handshake. Returns the initiator and the bytes of message 1.
    pub fn new(
        keypair: &KeyPair,
        expected_remote: [u8; 32],
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.secret)
            .build_initiator()?;

        let mut msg1 = vec![0u8; HANDSHAKE_BUF];
        let len = state.write_message(&[], &mut msg1)?;
        msg1.truncate(len);

        Ok((
            Self {
                state,
                expected_remote,
            },
            msg1,
        ))
    }

    /// Process message 2 and produce message 3 plus the sealed session.
    pub fn finish(mut self, msg2: &[u8]) -> Result<(SealedSession, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        self.state.read_message(msg2, &mut payload)?;

        match self.state.get_remote_static() {
            Some(remote) if remote == self.expected_remote.as_slice() => {}
            Some(remote) => {
                let mut seen = [0u8; 32];
                if remote.len() == 32 {
                    seen.copy_from_slice(remote);
                }
                return Err(CryptoError::UnexpectedPeer(fingerprint(&seen)));
            }
            None => return Err(CryptoError::MissingRemoteKey),
        }

        let mut msg3 = vec![0u8; HANDSHAKE_BUF];
        let len = self.state.write_message(&[], &mut msg3)?;
        msg3.truncate(len);

        let transport = self.state.into_stateless_transport_mode()?;
        Ok((SealedSession::new(transport), msg3))
    }
}

/// Responder side of the Noise_XX handshake (the daemon, or a test stub).
pub struct NoiseResponder {
    state: HandshakeState,
}

impl NoiseResponder {
    pub fn new(keypair: &KeyPair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.secret)
            .build_responder()?;
        Ok(Self { state })
    }

    /// Read message 1 and write message 2.
    pub fn respond(mut self, msg1: &[u8]) -> Result<(ResponderPending, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg1.len().max(1)];
        self.state.read_message(msg1, &mut payload)?;

        let mut msg2 = vec![0u8; HANDSHAKE_BUF];
        let len = self.state.write_message(&[], &mut msg2)?;
        msg2.truncate(len);

        Ok((ResponderPending { state: self.state }, msg2))
    }
}

/// Responder waiting for message 3.
pub struct ResponderPending {
    state: HandshakeState,
}

impl ResponderPending {
    /// Read message 3. Returns the session and the initiator's static key.
    pub fn finish(mut self, msg3: &[u8]) -> Result<(SealedSession, [u8; 32]), CryptoError> {
        let mut payload = vec![0u8; msg3.len()];
        self.state.read_message(msg3, &mut payload)?;

        let remote: [u8; 32] = self
            .state
            .get_remote_static()
            .ok_or(CryptoError::MissingRemoteKey)?
            .try_into()
            .map_err(|_| CryptoError::MissingRemoteKey)?;

        let transport = self.state.into_stateless_transport_mode()?;
        Ok((SealedSession::new(transport), remote))
    }
}

// ── Sealed session ────────────────────────────────────────────────────────────

/// Largest plaintext a single Noise transport message can carry.
pub const MAX_SEGMENT_PLAINTEXT: usize = 65535 - 16;

/// Nonce prefix plus MAC.
const SEGMENT_OVERHEAD: usize = 8 + 16;

/// A completed Noise_XX session sealing records on an ordered stream.
///
/// Wire format per record, one or more segments of:
///   [u64 nonce LE (8 bytes)] [Noise ciphertext (chunk + 16-byte MAC)]
///
/// Every segment but the last carries exactly `MAX_SEGMENT_PLAINTEXT`
/// bytes, so boundaries need no markers. An empty record is one segment.
/// The stream is ordered, so received nonces must strictly increase.
pub struct SealedSession {
    transport: StatelessTransportState,
    send_nonce: u64,
    next_recv: u64,
}

impl SealedSession {
    fn new(transport: StatelessTransportState) -> Self {
        Self {
            transport,
            send_nonce: 0,
            next_recv: 0,
        }
    }

    /// Encrypt plaintext of any length into `out`.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.clear();
        out.reserve(plaintext.len() + SEGMENT_OVERHEAD);

        let mut chunks = plaintext.chunks(MAX_SEGMENT_PLAINTEXT);
        let first = chunks.next().unwrap_or(&[]);
        for chunk in std::iter::once(first).chain(chunks) {
            let nonce = self.send_nonce;
            self.send_nonce += 1;

            let start = out.len();
            out.extend_from_slice(&nonce.to_le_bytes());
            out.resize(start + SEGMENT_OVERHEAD + chunk.len(), 0);
            let written = self
                .transport
                .write_message(nonce, chunk, &mut out[start + 8..])?;
            out.truncate(start + 8 + written);
        }
        Ok(())
    }

    /// Decrypt a record into `out`. Rejects replays, truncation and MAC
    /// failures.
    pub fn decrypt(&mut self, record: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.clear();
        let mut rest = record;
        loop {
            if rest.len() < SEGMENT_OVERHEAD {
                return Err(CryptoError::TooShort);
            }
            let take = rest.len().min(SEGMENT_OVERHEAD + MAX_SEGMENT_PLAINTEXT);
            let (segment, tail) = rest.split_at(take);

            let mut nonce_bytes = [0u8; 8];
            nonce_bytes.copy_from_slice(&segment[..8]);
            let nonce = u64::from_le_bytes(nonce_bytes);
            if nonce < self.next_recv {
                return Err(CryptoError::Replay);
            }

            let start = out.len();
            out.resize(start + segment.len() - 8, 0);
            let written = self
                .transport
                .read_message(nonce, &segment[8..], &mut out[start..])?;
            out.truncate(start + written);
            self.next_recv = nonce + 1;

            if tail.is_empty() {
                return Ok(());
            }
            rest = tail;
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("invalid Z85 text: {0}")]
    Z85(String),

    #[error("encoded key must be {KEY_ENCODED_LEN} characters, got {0}")]
    KeyLength(usize),

    #[error("public key does not match secret key")]
    KeyMismatch,

    #[error("peer presented an unexpected static key (fingerprint {0})")]
    UnexpectedPeer(String),

    #[error("peer did not present a static key")]
    MissingRemoteKey,

    #[error("ciphertext too short (need at least 24 bytes: 8 nonce + 16 MAC)")]
    TooShort,

    #[error("replayed or out-of-order nonce")]
    Replay,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
