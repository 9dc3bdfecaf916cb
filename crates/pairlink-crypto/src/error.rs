/// Error type for crypto operations.
///
/// `DecryptionFailed` is deliberately opaque: a short blob, an oversized blob, a
/// wrong key and a tampered tag all surface as the same variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid secret length: expected 32 bytes, got {0}")]
    InvalidSecretLength(usize),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("RNG failed")]
    RngError,
}
