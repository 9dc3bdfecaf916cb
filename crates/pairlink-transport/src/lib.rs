//! Transport abstractions consumed by the pairing core.
//!
//! The point-to-point connection, the pub/sub relay and the direct signaling
//! endpoint are external collaborators. This crate defines the traits the core
//! drives them through, the shared error classification (retriable or not), the
//! retry backoff policy, an HTTP implementation of the direct signaling client,
//! and in-memory doubles for tests and demos.

pub mod error;
pub mod traits;
pub mod backoff;
pub mod testing;

#[cfg(feature = "http")]
pub mod http;

pub use error::*;
pub use traits::*;
pub use backoff::*;

#[cfg(feature = "http")]
pub use http::*;
