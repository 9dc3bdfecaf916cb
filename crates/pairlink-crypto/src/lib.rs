//! Cryptographic primitives for pairlink.
//!
//! Everything here is keyed off the 32-byte shared secret carried by the QR
//! invite: purpose-bound key derivation, the signaling AEAD, HMAC proofs, the
//! relay topic digest and the signaling nonce replay cache.

#![forbid(unsafe_code)]

pub mod error;
pub mod secret;
pub mod kdf;
pub mod message_crypto;
pub mod mac;
pub mod hash;
pub mod replay;
pub mod utils;

pub use error::CryptoError;
pub use secret::{DerivedKey, SharedSecret};

#[cfg(test)]
mod proptests;
