//! HMAC-SHA256 proofs.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::utils::constant_time_compare;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256(key, data).
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take keys of any size");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// HMAC over several parts, fed in order without separators.
pub fn hmac_sha256_parts(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take keys of any size");
    for part in parts {
        mac.update(part);
    }
    let out = mac.finalize().into_bytes();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Recompute HMAC(key, data) and compare against `tag` in constant time.
pub fn verify_hmac(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let expected = hmac_sha256(key, data);
    constant_time_compare(&expected, tag)
}
