//! Authenticated encryption for signaling messages.
//!
//! ChaCha20Poly1305 under the signaling key with a fresh random nonce per
//! message. Blob layout: iv(12) || ciphertext || tag(16).

#![forbid(unsafe_code)]

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::error::CryptoError;
use crate::secret::DerivedKey;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Smallest valid blob: an empty plaintext.
pub const MIN_BLOB_LEN: usize = IV_LEN + TAG_LEN;
/// Largest blob accepted by `decrypt`.
pub const MAX_BLOB_LEN: usize = 64 * 1024;

#[derive(Clone)]
pub struct MessageCrypto {
    aead: ChaCha20Poly1305,
}

impl MessageCrypto {
    pub fn new(key: &DerivedKey) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Encrypt with a fresh CSPRNG nonce.
    ///
    /// Returns: iv(12) || ciphertext+tag
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut iv).map_err(|_| CryptoError::RngError)?;

        let ct = self
            .aead
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(IV_LEN + ct.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt a blob produced by `encrypt`.
    ///
    /// Rejects blobs shorter than 28 or longer than 65536 bytes. On any tag
    /// mismatch nothing of the plaintext is returned.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < MIN_BLOB_LEN || blob.len() > MAX_BLOB_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let (iv, ct) = blob.split_at(IV_LEN);
        self.aead
            .decrypt(Nonce::from_slice(iv), ct)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for MessageCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageCrypto(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{derive_key, LABEL_AUTH, LABEL_SIGNALING};

    fn crypto(secret: [u8; 32]) -> MessageCrypto {
        MessageCrypto::new(&derive_key(&secret, LABEL_SIGNALING).unwrap())
    }

    #[test]
    fn test_round_trip_sizes() {
        let c = crypto([0x42; 32]);
        for len in [0usize, 1, 65000] {
            let msg = vec![0x5Au8; len];
            let blob = c.encrypt(&msg).unwrap();
            assert_eq!(blob.len(), len + MIN_BLOB_LEN);
            assert_eq!(c.decrypt(&blob).unwrap(), msg);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let c = crypto([0x42; 32]);
        let a = c.encrypt(b"same").unwrap();
        let b = c.encrypt(b"same").unwrap();
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
    }

    #[test]
    fn test_rejects_short_and_long_blobs() {
        let c = crypto([0x42; 32]);
        assert_eq!(c.decrypt(&[0u8; 27]).unwrap_err(), CryptoError::DecryptionFailed);
        assert_eq!(c.decrypt(&[]).unwrap_err(), CryptoError::DecryptionFailed);
        assert_eq!(
            c.decrypt(&vec![0u8; MAX_BLOB_LEN + 1]).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn test_flipped_last_byte_fails() {
        let c = crypto([0x42; 32]);
        let mut blob = c.encrypt(b"offer").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(c.decrypt(&blob).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = crypto([1; 32]).encrypt(b"hello").unwrap();
        assert!(crypto([2; 32]).decrypt(&blob).is_err());

        // Same secret, different purpose.
        let auth = MessageCrypto::new(&derive_key(&[1; 32], LABEL_AUTH).unwrap());
        assert!(auth.decrypt(&blob).is_err());
    }
}
