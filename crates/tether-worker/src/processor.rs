//! The business-logic seam: turn request arguments into a result.

use std::time::Duration;

use tether_core::message::ECHO_MARKER;
use tether_core::{TypedValue, WorkErrorKind};

/// A processor failure, reported to the daemon as a `WorkError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("request timed out: {0}")]
    RequestTimedOut(String),

    #[error("request failed: {0}")]
    RequestError(String),
}

impl WorkError {
    pub fn kind(&self) -> WorkErrorKind {
        match self {
            WorkError::PermissionDenied(_) => WorkErrorKind::PermissionDenied,
            WorkError::InvalidRequest(_) => WorkErrorKind::InvalidRequest,
            WorkError::InternalError(_) => WorkErrorKind::InternalError,
            WorkError::RequestTimedOut(_) => WorkErrorKind::RequestTimedOut,
            WorkError::RequestError(_) => WorkErrorKind::RequestError,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            WorkError::PermissionDenied(m)
            | WorkError::InvalidRequest(m)
            | WorkError::InternalError(m)
            | WorkError::RequestTimedOut(m)
            | WorkError::RequestError(m) => m,
        }
    }
}

/// Handles one work item. Runs inline on the session task.
pub trait WorkProcessor {
    fn process(
        &mut self,
        arguments: Vec<TypedValue>,
        timeout: Option<Duration>,
    ) -> Result<TypedValue, WorkError>;
}

impl<F> WorkProcessor for F
where
    F: FnMut(Vec<TypedValue>, Option<Duration>) -> Result<TypedValue, WorkError>,
{
    fn process(
        &mut self,
        arguments: Vec<TypedValue>,
        timeout: Option<Duration>,
    ) -> Result<TypedValue, WorkError> {
        self(arguments, timeout)
    }
}

/// Replies with `["echo_response", arguments...]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProcessor;

impl WorkProcessor for EchoProcessor {
    fn process(
        &mut self,
        arguments: Vec<TypedValue>,
        _timeout: Option<Duration>,
    ) -> Result<TypedValue, WorkError> {
        let mut out = Vec::with_capacity(arguments.len() + 1);
        out.push(TypedValue::str(ECHO_MARKER));
        out.extend(arguments);
        Ok(TypedValue::List(out))
    }
}
