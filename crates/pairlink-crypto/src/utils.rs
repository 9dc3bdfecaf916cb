//! Constant-time comparison and randomness helpers.

use constant_time_eq::constant_time_eq;

use crate::error::CryptoError;

/// Compare two byte slices in constant time.
///
/// Slices of different length compare unequal. Use for every MAC comparison.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// `N` bytes from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out).map_err(|_| CryptoError::RngError)?;
    Ok(out)
}
