//! Purpose-bound key derivation from the shared secret.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::secret::{DerivedKey, SECRET_LEN};

/// Fixed HKDF salt. MUST NOT change once released.
const KDF_SALT: &[u8] = b"pairlink_kdf_v1";

/// Label for the handshake / direct-request signing key.
pub const LABEL_AUTH: &str = "auth";
/// Label for the signaling AEAD key.
pub const LABEL_SIGNALING: &str = "signaling";

/// Derive a 32-byte key for `label` from a 32-byte secret.
///
/// HKDF-SHA256 with a fixed salt and the label as `info`: deterministic for a
/// given (secret, label) and independent across labels.
pub fn derive_key(secret: &[u8], label: &str) -> Result<DerivedKey, CryptoError> {
    if secret.len() != SECRET_LEN {
        return Err(CryptoError::InvalidSecretLength(secret.len()));
    }
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret);
    let mut okm = [0u8; 32];
    hk.expand(label.as_bytes(), &mut okm)
        .map_err(|_| CryptoError::InvalidSecretLength(secret.len()))?;
    Ok(DerivedKey::from_bytes(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_give_distinct_keys() {
        let secret = [0x42u8; 32];
        let auth = derive_key(&secret, LABEL_AUTH).unwrap();
        let signaling = derive_key(&secret, LABEL_SIGNALING).unwrap();
        assert_ne!(auth.as_bytes(), signaling.as_bytes());
    }

    #[test]
    fn test_deterministic() {
        let secret = [0x07u8; 32];
        let a = derive_key(&secret, LABEL_AUTH).unwrap();
        let b = derive_key(&secret, LABEL_AUTH).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_rejects_bad_secret_length() {
        assert_eq!(
            derive_key(&[0u8; 16], LABEL_AUTH).unwrap_err(),
            CryptoError::InvalidSecretLength(16)
        );
        assert!(derive_key(&[], LABEL_AUTH).is_err());
    }

    #[test]
    fn test_different_secrets_differ() {
        let a = derive_key(&[1u8; 32], LABEL_AUTH).unwrap();
        let b = derive_key(&[2u8; 32], LABEL_AUTH).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
