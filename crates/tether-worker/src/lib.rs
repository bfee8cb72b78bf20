//! tether-worker: enrollment, transport and the dispatch loop of a tether
//! worker. The `tetherw` binary is a thin shell around this crate.

pub mod enrollment;
pub mod processor;
pub mod session;
pub mod token;
pub mod transport;

pub use enrollment::{
    Enrolled, EnrollmentClient, EnrollmentError, EnrollmentFailure, EnrollmentState, RetryPolicy,
};
pub use processor::{EchoProcessor, WorkError, WorkProcessor};
pub use session::{RunOutcome, SessionError, SessionState, WorkerSession};
pub use token::{EnrollmentToken, TokenResolver};
pub use transport::{Endpoint, NetEnroller, NetTransport, TransportError};
