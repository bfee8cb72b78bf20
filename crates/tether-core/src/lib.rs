//! tether-core: shared types, wire format, key storage and cryptographic
//! primitives for tether workers. All other tether crates depend on this one.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod message;
pub mod wire;

pub use message::{Envelope, RequestId, TypedValue, WorkErrorKind, WorkItem, WorkerId};
