//! Zeroizing containers for the shared secret and the keys derived from it.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const SECRET_LEN: usize = 32;

/// The 32-byte secret established out-of-band (QR code).
///
/// Wiped on drop; `wipe` lets a session zero it early on completion or failure.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SECRET_LEN]);

impl SharedSecret {
    pub fn new(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from untrusted input; anything but exactly 32 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SECRET_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSecretLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Fresh random secret, as generated by the host when it renders the QR code.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; SECRET_LEN];
        getrandom::getrandom(&mut bytes).map_err(|_| CryptoError::RngError)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    pub fn wipe(&mut self) {
        self.0.zeroize();
    }

    pub fn is_wiped(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// A 32-byte key bound to one purpose label.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn wipe(&mut self) {
        self.0.zeroize();
    }

    pub fn is_wiped(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert_eq!(
            SharedSecret::from_slice(&[1u8; 31]).unwrap_err(),
            CryptoError::InvalidSecretLength(31)
        );
        assert_eq!(
            SharedSecret::from_slice(&[1u8; 33]).unwrap_err(),
            CryptoError::InvalidSecretLength(33)
        );
        assert!(SharedSecret::from_slice(&[1u8; 32]).is_ok());
    }

    #[test]
    fn test_wipe_zeroes() {
        let mut secret = SharedSecret::new([0xAB; 32]);
        assert!(!secret.is_wiped());
        secret.wipe();
        assert!(secret.is_wiped());
    }

    #[test]
    fn test_debug_redacts() {
        let secret = SharedSecret::new([0xAB; 32]);
        assert_eq!(format!("{:?}", secret), "SharedSecret(..)");
    }
}
