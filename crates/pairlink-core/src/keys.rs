//! Per-session key material.

use pairlink_crypto::kdf::{derive_key, LABEL_AUTH, LABEL_SIGNALING};
use pairlink_crypto::{CryptoError, DerivedKey, SharedSecret};

/// The two purpose-bound keys derived from one shared secret.
///
/// Both keys zeroize on drop; `wipe` zeroes them early.
#[derive(Clone, Debug)]
pub struct SessionKeys {
    /// Handshake HMACs and direct request signatures
    pub auth: DerivedKey,
    /// Signaling envelope AEAD
    pub signaling: DerivedKey,
}

impl SessionKeys {
    pub fn derive(secret: &SharedSecret) -> Result<Self, CryptoError> {
        Ok(Self {
            auth: derive_key(secret.as_bytes(), LABEL_AUTH)?,
            signaling: derive_key(secret.as_bytes(), LABEL_SIGNALING)?,
        })
    }

    pub fn wipe(&mut self) {
        self.auth.wipe();
        self.signaling.wipe();
    }

    pub fn is_wiped(&self) -> bool {
        self.auth.is_wiped() && self.signaling.is_wiped()
    }
}
