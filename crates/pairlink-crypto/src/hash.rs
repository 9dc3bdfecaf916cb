use sha2::{Digest, Sha256};

use crate::secret::SharedSecret;

/// Prefix for relay topics; keeps them recognizable on a shared broker.
pub const RELAY_TOPIC_PREFIX: &str = "pl-";
/// Number of hex characters of the digest kept in the topic.
pub const RELAY_TOPIC_HEX_LEN: usize = 32;

const TOPIC_DOMAIN: &[u8] = b"pairlink_relay_topic_v1";

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Relay topic both devices subscribe to: `pl-` + 32 hex chars of
/// sha256(domain || secret). Reveals nothing usable about the secret.
pub fn relay_topic(secret: &SharedSecret) -> String {
    let mut h = Sha256::new();
    h.update(TOPIC_DOMAIN);
    h.update(secret.as_bytes());
    let digest = h.finalize();
    let hex = hex::encode(digest);
    format!("{}{}", RELAY_TOPIC_PREFIX, &hex[..RELAY_TOPIC_HEX_LEN])
}
