//! Worker session: attach to the daemon, then serve broadcast work.
//!
//! Lifecycle:
//!   Created → Attaching → Attached → Running → Terminated
//!   Attaching → Rejected | AuthFailed
//!
//! One task owns both channels. Replies go out on the correlated request
//! channel as `[worker id][envelope]`; the daemon answers each with one
//! frame (an `Ack` in steady state).

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;

use tether_core::message::{EnvelopeKind, WORKER_BROADCAST_TOPIC};
use tether_core::wire::{self, CodecError};
use tether_core::{Envelope, RequestId, WorkItem, WorkerId};

use crate::processor::{WorkError, WorkProcessor};
use crate::transport::{BroadcastChannel, RequestChannel, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Attaching,
    Attached,
    Running,
    Terminated,
    Rejected,
    AuthFailed,
}

/// Why `run` returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The daemon sent a `Terminate` addressed to us or to everyone.
    Terminated,
    /// The caller's shutdown future resolved.
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("daemon rejected attach: {0}")]
    Rejected(String),

    #[error("daemon refused credentials: {0}")]
    AuthFailed(String),

    #[error("undecodable attach reply: {0}")]
    Codec(#[from] CodecError),

    #[error("unexpected {0:?} in reply to attach")]
    UnexpectedReply(EnvelopeKind),

    #[error("session is {0:?}; operation needs an attached session")]
    InvalidState(SessionState),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct WorkerSession<T: Transport> {
    transport: T,
    worker_id: WorkerId,
    worker_type: String,
    lenient_attach: bool,
    state: SessionState,
    request: Option<T::Request>,
    broadcast: Option<T::Broadcast>,
}

impl<T: Transport> WorkerSession<T> {
    pub fn new(transport: T, worker_id: WorkerId, worker_type: impl Into<String>) -> Self {
        Self {
            transport,
            worker_id,
            worker_type: worker_type.into(),
            lenient_attach: false,
            state: SessionState::Created,
            request: None,
            broadcast: None,
        }
    }

    /// Accept any non-empty attach reply, even one that fails to decode.
    pub fn lenient_attach(mut self, lenient: bool) -> Self {
        self.lenient_attach = lenient;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    // ── Setup ─────────────────────────────────────────────────────────────────

    /// Open the correlated channel and announce this worker.
    pub async fn attach(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Created {
            return Err(SessionError::InvalidState(self.state));
        }
        self.state = SessionState::Attaching;

        match self.try_attach().await {
            Ok(()) => {
                self.state = SessionState::Attached;
                tracing::info!(
                    worker_id = %self.worker_id,
                    worker_type = %self.worker_type,
                    "attached to daemon"
                );
                Ok(())
            }
            Err(e) => {
                self.state = match e {
                    SessionError::Rejected(_) => SessionState::Rejected,
                    SessionError::AuthFailed(_) => SessionState::AuthFailed,
                    _ => SessionState::Created,
                };
                self.request = None;
                Err(e)
            }
        }
    }

    async fn try_attach(&mut self) -> Result<(), SessionError> {
        let mut request = self.transport.open_request().await?;
        let attach = Envelope::AttachWorker {
            worker_id: self.worker_id,
            worker_type: self.worker_type.clone(),
        };
        let reply = request.request(self.frame(&attach)).await?;
        let body = reply.last().cloned().unwrap_or_default();

        match wire::decode(&body) {
            Ok(Envelope::Attached) => {}
            Ok(Envelope::Rejected { reason }) => return Err(SessionError::Rejected(reason)),
            Ok(Envelope::AuthFailed { reason }) => return Err(SessionError::AuthFailed(reason)),
            Ok(other) if !self.lenient_attach => {
                return Err(SessionError::UnexpectedReply(other.kind()))
            }
            Err(e) if !self.lenient_attach || body.is_empty() => return Err(e.into()),
            Ok(other) => {
                tracing::warn!(kind = ?other.kind(), "accepting unexpected attach reply");
            }
            Err(e) => {
                tracing::warn!(error = %e, len = body.len(), "accepting undecodable attach reply");
            }
        }

        self.request = Some(request);
        Ok(())
    }

    /// Subscribe to worker broadcasts.
    pub async fn subscribe(&mut self) -> Result<(), SessionError> {
        let broadcast = self.transport.open_broadcast(WORKER_BROADCAST_TOPIC).await?;
        self.broadcast = Some(broadcast);
        tracing::debug!(worker_id = %self.worker_id, "subscribed to worker broadcasts");
        Ok(())
    }

    // ── Dispatch loop ─────────────────────────────────────────────────────────

    /// Serve until the daemon terminates this worker.
    pub async fn run<P: WorkProcessor>(
        &mut self,
        processor: &mut P,
    ) -> Result<RunOutcome, SessionError> {
        self.run_until(processor, std::future::pending()).await
    }

    /// Serve until terminated or until `shutdown` resolves.
    pub async fn run_until<P, S>(
        &mut self,
        processor: &mut P,
        shutdown: S,
    ) -> Result<RunOutcome, SessionError>
    where
        P: WorkProcessor,
        S: Future<Output = ()>,
    {
        if self.state != SessionState::Attached || self.request.is_none() {
            return Err(SessionError::InvalidState(self.state));
        }
        if self.broadcast.is_none() {
            self.subscribe().await?;
        }
        self.state = SessionState::Running;
        tracing::info!(worker_id = %self.worker_id, "worker running");

        tokio::pin!(shutdown);
        loop {
            let Some(broadcast) = self.broadcast.as_mut() else {
                return Err(SessionError::InvalidState(self.state));
            };
            let parts = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    self.state = SessionState::Terminated;
                    return Ok(RunOutcome::Shutdown);
                }
                received = broadcast.recv() => match received {
                    Ok(parts) => parts,
                    Err(e) => {
                        tracing::error!(error = %e, "broadcast channel failed");
                        self.state = SessionState::Terminated;
                        return Err(e.into());
                    }
                },
            };

            if self.dispatch(processor, parts).await {
                self.state = SessionState::Terminated;
                return Ok(RunOutcome::Terminated);
            }
        }
    }

    /// Handle one broadcast. Returns true when the session should end.
    async fn dispatch<P: WorkProcessor>(&mut self, processor: &mut P, parts: Vec<Bytes>) -> bool {
        let Some(payload) = parts.get(1) else {
            tracing::warn!(parts = parts.len(), "broadcast without payload");
            return false;
        };
        let envelope = match wire::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable broadcast");
                return false;
            }
        };

        match envelope {
            Envelope::Ping => {
                tracing::debug!("ping");
                let pong = Envelope::Pong {
                    worker_id: self.worker_id,
                    worker_type: self.worker_type.clone(),
                };
                self.reply(&pong).await;
            }
            Envelope::WorkRequest(item) => {
                if item.destination != self.worker_id {
                    tracing::trace!(request_id = %item.request_id, "work for another worker");
                    return false;
                }
                self.handle_work(processor, item).await;
            }
            Envelope::Terminate { target } => match target {
                None => {
                    tracing::info!("terminate received for all workers");
                    return true;
                }
                Some(id) if id == self.worker_id => {
                    tracing::info!("terminate received");
                    return true;
                }
                Some(_) => tracing::trace!("terminate for another worker"),
            },
            other => {
                tracing::debug!(kind = ?other.kind(), "ignoring broadcast");
            }
        }
        false
    }

    async fn handle_work<P: WorkProcessor>(&mut self, processor: &mut P, item: WorkItem) {
        let request_id = item.request_id;
        tracing::debug!(
            %request_id,
            args = item.arguments.len(),
            timeout_ms = item.timeout.map(|t| t.as_millis() as u64),
            "work request"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            processor.process(item.arguments, item.timeout)
        }))
        .unwrap_or_else(|payload| {
            Err(WorkError::InternalError(format!(
                "processor panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

        let reply = match outcome {
            Ok(result) => Envelope::WorkResult {
                worker_id: self.worker_id,
                request_id,
                result,
            },
            Err(e) => {
                tracing::warn!(%request_id, error = %e, "processor failed");
                self.work_error(request_id, &e)
            }
        };

        let Err(e) = self.send_reply(&reply).await else {
            return;
        };
        match e {
            // Refused before anything was written; the channel is intact.
            TransportError::Frame(reason) if reply.kind() == EnvelopeKind::WorkResult => {
                tracing::warn!(%request_id, %reason, "result cannot be sent, reporting failure");
                let failure =
                    WorkError::InternalError(format!("result could not be sent: {reason}"));
                let fallback = self.work_error(request_id, &failure);
                self.reply(&fallback).await;
            }
            e => tracing::warn!(%request_id, error = %e, "failed to send reply"),
        }
    }

    fn work_error(&self, request_id: RequestId, error: &WorkError) -> Envelope {
        Envelope::WorkError {
            worker_id: self.worker_id,
            request_id,
            kind: error.kind(),
            message: error.message().to_string(),
        }
    }

    /// Send a reply, logging any failure. The session keeps serving.
    async fn reply(&mut self, envelope: &Envelope) {
        if let Err(e) = self.send_reply(envelope).await {
            tracing::warn!(kind = ?envelope.kind(), error = %e, "failed to send reply");
        }
    }

    /// Send on the correlated channel and consume the daemon's answer.
    async fn send_reply(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = self.frame(envelope);
        let Some(request) = self.request.as_mut() else {
            return Err(TransportError::Closed);
        };
        let answer = request.request(frame).await?;
        match answer.last().map(|b| wire::decode(b)) {
            Some(Ok(Envelope::Ack)) => {}
            Some(Ok(other)) => tracing::debug!(kind = ?other.kind(), "unexpected answer to reply"),
            Some(Err(e)) => tracing::debug!(error = %e, "undecodable answer to reply"),
            None => tracing::debug!("empty answer to reply"),
        }
        Ok(())
    }

    fn frame(&self, envelope: &Envelope) -> Vec<Bytes> {
        vec![
            Bytes::copy_from_slice(self.worker_id.as_bytes()),
            wire::encode(envelope),
        ]
    }

    /// Drop both channels. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.request.take().is_some() | self.broadcast.take().is_some() {
            tracing::info!(worker_id = %self.worker_id, "session closed");
        }
        if matches!(
            self.state,
            SessionState::Attached | SessionState::Running | SessionState::Attaching
        ) {
            self.state = SessionState::Terminated;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
