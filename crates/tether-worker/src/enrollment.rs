//! Enrollment: trade a one-time token for a durable identity.
//!
//! A persisted identity short-circuits everything. Otherwise the worker
//! resolves a token, loads (or creates) its keypair, and asks the daemon
//! for an identifier, retrying with capped exponential backoff.

use std::time::Duration;

use tether_core::config::EnrollmentConfig;
use tether_core::crypto::{decode_key, KEY_ENCODED_LEN};
use tether_core::identity::{KeyStore, KeyStoreError, WorkerIdentity};
use tether_core::message::{EnrollmentRequest, EnrollmentResponse};

use crate::token::{EnrollmentToken, TokenResolver};
use crate::transport::{Enroller, TransportError};

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Capped exponential backoff over a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
            max_attempts: 30,
        }
    }
}

impl From<&EnrollmentConfig> for RetryPolicy {
    fn from(config: &EnrollmentConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Every delay between consecutive attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay_after(attempt))
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    NotEnrolled,
    Enrolling { attempt: u32 },
    Enrolled,
    Failed,
}

/// What a session needs from enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrolled {
    /// Daemon's public key, Z85-encoded.
    pub daemon_public_key: String,
    pub worker_identifier: String,
}

impl From<&WorkerIdentity> for Enrolled {
    fn from(identity: &WorkerIdentity) -> Self {
        Self {
            daemon_public_key: identity.daemon_public_key.clone(),
            worker_identifier: identity.identifier.clone(),
        }
    }
}

/// Why a single enrollment attempt failed. Every variant is retried.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("daemon refused enrollment: {0}")]
    Refused(String),

    #[error("invalid enrollment response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error(
        "no enrollment token found \
         (flag, token file, default token file, or $TETHER_ENROLLMENT_TOKEN)"
    )]
    NoToken,

    #[error("enrollment failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: EnrollmentFailure,
    },

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct EnrollmentClient<E> {
    store: KeyStore,
    enroller: E,
    tokens: TokenResolver,
    hostname: String,
    policy: RetryPolicy,
    state: EnrollmentState,
}

impl<E: Enroller> EnrollmentClient<E> {
    pub fn new(
        store: KeyStore,
        enroller: E,
        tokens: TokenResolver,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            store,
            enroller,
            tokens,
            hostname: hostname.into(),
            policy: RetryPolicy::default(),
            state: EnrollmentState::NotEnrolled,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    pub fn enroller(&self) -> &E {
        &self.enroller
    }

    /// Return the persisted identity, enrolling first if there is none.
    pub async fn ensure_enrolled(&mut self) -> Result<Enrolled, EnrollmentError> {
        if let Some(identity) = self.store.load_identity()? {
            tracing::info!(
                identifier = %identity.identifier,
                service_type = %identity.service_type,
                enrolled_at = %identity.enrolled_at,
                "using persisted identity"
            );
            self.state = EnrollmentState::Enrolled;
            return Ok(Enrolled::from(&identity));
        }

        let Some(token) = self.tokens.resolve() else {
            self.state = EnrollmentState::Failed;
            return Err(EnrollmentError::NoToken);
        };

        let keypair = match self.store.load_or_generate_keypair() {
            Ok(k) => k,
            Err(e) => {
                self.state = EnrollmentState::Failed;
                return Err(e.into());
            }
        };
        let request = self.request(&token, keypair.public_z85());

        let enrolled = self.enroll_with_retry(&request).await?;

        let identity = WorkerIdentity::new(
            enrolled.worker_identifier.clone(),
            self.store.service_type(),
            self.hostname.clone(),
            enrolled.daemon_public_key.clone(),
        );
        if let Err(e) = self.store.save_identity(&identity) {
            self.state = EnrollmentState::Failed;
            return Err(e.into());
        }
        self.state = EnrollmentState::Enrolled;
        Ok(enrolled)
    }

    fn request(&self, token: &EnrollmentToken, public_key: String) -> EnrollmentRequest {
        EnrollmentRequest {
            token: token.as_str().to_string(),
            public_key,
            service_type: self.store.service_type().to_string(),
            hostname: self.hostname.clone(),
        }
    }

    async fn enroll_with_retry(
        &mut self,
        request: &EnrollmentRequest,
    ) -> Result<Enrolled, EnrollmentError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.state = EnrollmentState::Enrolling { attempt };

            let failure = match self.enroller.enroll(request).await {
                Ok(response) => match accept(response) {
                    Ok(enrolled) => {
                        tracing::info!(
                            attempt,
                            identifier = %enrolled.worker_identifier,
                            "enrolled with daemon"
                        );
                        return Ok(enrolled);
                    }
                    Err(failure) => failure,
                },
                Err(e) => EnrollmentFailure::from(e),
            };

            if attempt >= self.policy.max_attempts {
                self.state = EnrollmentState::Failed;
                tracing::error!(attempts = attempt, error = %failure, "enrollment gave up");
                return Err(EnrollmentError::RetriesExhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.policy.delay_after(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "enrollment attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Validate a daemon reply. Anything short of a complete acceptance is a
/// retryable failure.
fn accept(response: EnrollmentResponse) -> Result<Enrolled, EnrollmentFailure> {
    let invalid = EnrollmentFailure::InvalidResponse;

    if !response.success {
        return Err(EnrollmentFailure::Refused(
            response.error.unwrap_or_else(|| "no reason given".into()),
        ));
    }
    let daemon_public_key = response
        .daemon_public_key
        .ok_or_else(|| invalid("missing daemon public key".into()))?;
    if daemon_public_key.len() != KEY_ENCODED_LEN {
        return Err(invalid(format!(
            "daemon public key has {} characters, expected {KEY_ENCODED_LEN}",
            daemon_public_key.len()
        )));
    }
    decode_key(&daemon_public_key).map_err(|e| invalid(format!("daemon public key: {e}")))?;

    let worker_identifier = response
        .identifier
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| invalid("missing worker identifier".into()))?;

    Ok(Enrolled {
        daemon_public_key,
        worker_identifier,
    })
}
