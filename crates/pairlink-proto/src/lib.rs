//! Wire format definitions for pairlink.
//!
//! Two envelopes cross the wire:
//! - the auth envelope, a length-delimited protobuf `oneof` exchanged over the
//!   already-open peer channel during the handshake;
//! - the signaling envelope, a JSON object that is always sealed with the
//!   signaling key before it leaves the process.

#![forbid(unsafe_code)]

pub mod auth;
pub mod signaling;

/// Versioned re-exports, mirroring the on-wire message names.
pub mod v1 {
    pub use crate::auth::*;
    pub use crate::signaling::*;
}

/// Constants for field sizes.
pub mod sizes {
    /// Handshake nonces (challenge and client nonce).
    pub const AUTH_NONCE_SIZE: usize = 32;
    /// Signaling message nonces.
    pub const SIGNAL_NONCE_SIZE: usize = 16;
}

/// Errors raised while decoding wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("empty message")]
    Empty,
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("envelope has no message kind")]
    MissingKind,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
