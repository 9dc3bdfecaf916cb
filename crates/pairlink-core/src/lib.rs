//! pairlink core - pairing a device with a host from a scanned QR code.
//!
//! This crate implements:
//! - Message validation for signaling envelopes (session, type, freshness, replay)
//! - The mutual HMAC challenge/response handshake (both halves)
//! - Encrypted signaling exchange over a direct endpoint with relay fallback
//! - Ownership tracking for the live connection and its handoff
//! - The pairing lifecycle state machine and its progress telemetry
//! - QR invite parsing, configuration and credential storage

#![forbid(unsafe_code)]

// Protocol
pub mod validator;
pub mod handshake;
pub mod signaling;

// State machines
pub mod ownership;
pub mod lifecycle;
pub mod progress;

// Infrastructure
pub mod config;
pub mod store;

// Supporting modules
pub mod errors;
pub mod keys;
pub mod qr;
pub mod harness;

pub use config::PairingConfig;
pub use errors::{CoreError, FailureReason};
pub use lifecycle::{LocalDevice, PairingDeps, PairingLifecycle, PairingState, PairingTask};
pub use qr::PairingInvite;
