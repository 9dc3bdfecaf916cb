//! Acceptance filter for inbound signaling messages.
//!
//! Checks run in a fixed order and stop at the first failure: type, session,
//! timestamp, nonce, payload. A nonce is only remembered once every earlier
//! check has passed, so a message rejected for its type or age does not burn
//! its nonce.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use pairlink_crypto::replay::{NonceCache, DEFAULT_NONCE_CACHE_CAPACITY};
use pairlink_proto::sizes::SIGNAL_NONCE_SIZE;
use pairlink_proto::v1::{SignalEnvelope, SignalPayload, SignalType};

use crate::config::ValidationConfig;
use crate::errors::ValidationError;

/// Default accepted clock skew, in seconds, either direction.
pub const DEFAULT_TIMESTAMP_WINDOW_SECS: i64 = 30;

/// Maximum device name length in UTF-16 code units.
pub const MAX_DEVICE_NAME_UNITS: usize = 64;

/// SDP version line marker.
const SDP_VERSION_MARKER: &str = "v=";
/// SDP media line marker.
const SDP_MEDIA_MARKER: &str = "m=";

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct MessageValidator {
    expected_session_id: String,
    expected_type: SignalType,
    window_secs: i64,
    nonces: Mutex<NonceCache>,
}

impl MessageValidator {
    /// Validator with the default window and cache capacity.
    ///
    /// An empty `expected_session_id` only matches messages whose session id is
    /// also empty (reconnection mode).
    pub fn new(expected_session_id: impl Into<String>, expected_type: SignalType) -> Self {
        Self::with_limits(
            expected_session_id,
            expected_type,
            DEFAULT_TIMESTAMP_WINDOW_SECS,
            DEFAULT_NONCE_CACHE_CAPACITY,
        )
    }

    pub fn with_limits(
        expected_session_id: impl Into<String>,
        expected_type: SignalType,
        window_secs: i64,
        nonce_cache_capacity: usize,
    ) -> Self {
        Self {
            expected_session_id: expected_session_id.into(),
            expected_type,
            window_secs,
            nonces: Mutex::new(NonceCache::new(nonce_cache_capacity)),
        }
    }

    pub fn from_config(
        expected_session_id: impl Into<String>,
        expected_type: SignalType,
        config: &ValidationConfig,
    ) -> Self {
        Self::with_limits(
            expected_session_id,
            expected_type,
            config.timestamp_window_secs,
            config.nonce_cache_capacity,
        )
    }

    pub fn expected_type(&self) -> SignalType {
        self.expected_type
    }

    pub fn expected_session_id(&self) -> &str {
        &self.expected_session_id
    }

    /// Validate against the system clock.
    pub fn validate(&self, msg: &SignalEnvelope) -> Result<(), ValidationError> {
        self.validate_at(msg, unix_now())
    }

    /// Validate against an explicit clock (unix seconds).
    pub fn validate_at(&self, msg: &SignalEnvelope, now: i64) -> Result<(), ValidationError> {
        let actual = msg.signal_type();
        if actual != self.expected_type {
            return Err(ValidationError::WrongMessageType {
                expected: self.expected_type,
                actual,
            });
        }

        if msg.session_id != self.expected_session_id {
            return Err(ValidationError::InvalidSession);
        }

        let skew = msg.timestamp.saturating_sub(now);
        if skew < -self.window_secs || skew > self.window_secs {
            return Err(ValidationError::InvalidTimestamp);
        }

        let nonce = hex::decode(&msg.nonce).map_err(|_| ValidationError::InvalidNonce)?;
        if nonce.len() != SIGNAL_NONCE_SIZE {
            return Err(ValidationError::InvalidNonce);
        }
        let mut nonces = self.nonces.lock();
        if nonces.contains(&nonce) {
            return Err(ValidationError::NonceReplay);
        }
        check_payload(msg)?;

        // Only fully valid messages consume a nonce slot.
        nonces
            .check_and_insert(&nonce)
            .map_err(|_| ValidationError::NonceReplay)
    }

    /// Forget every remembered nonce (session restart).
    pub fn clear_nonce_cache(&self) {
        self.nonces.lock().clear();
    }

    pub fn remembered_nonces(&self) -> usize {
        self.nonces.lock().len()
    }
}

impl std::fmt::Debug for MessageValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageValidator")
            .field("expected_session_id", &self.expected_session_id)
            .field("expected_type", &self.expected_type)
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

fn check_payload(msg: &SignalEnvelope) -> Result<(), ValidationError> {
    if let SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } = &msg.payload {
        if !sdp.contains(SDP_VERSION_MARKER) || !sdp.contains(SDP_MEDIA_MARKER) {
            return Err(ValidationError::InvalidSdp);
        }
    }

    if msg.signal_type().is_request() {
        if !is_valid_identifier(&msg.device_id) {
            return Err(ValidationError::MissingDeviceId);
        }
        if !is_valid_identifier(&msg.device_name) {
            return Err(ValidationError::MissingDeviceName);
        }
    }

    Ok(())
}

fn is_valid_identifier(value: &str) -> bool {
    !value.trim().is_empty() && !value.chars().any(char::is_control)
}

/// Clean a peer-supplied device name for display.
///
/// Trims surrounding whitespace, strips C0 control characters and DEL, keeps
/// all other Unicode and truncates to 64 UTF-16 code units without splitting
/// a surrogate pair.
pub fn sanitize_device_name(raw: &str) -> String {
    let mut out = String::new();
    let mut units = 0usize;
    for c in raw.trim().chars().filter(|c| !is_c0_control(*c)) {
        let width = c.len_utf16();
        if units + width > MAX_DEVICE_NAME_UNITS {
            break;
        }
        units += width;
        out.push(c);
    }
    // Stripping may expose whitespace at the ends.
    out.trim().to_string()
}

fn is_c0_control(c: char) -> bool {
    c <= '\u{1f}' || c == '\u{7f}'
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_000_000;
    const SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";

    fn nonce(i: u32) -> String {
        let mut n = [0u8; 16];
        n[..4].copy_from_slice(&i.to_be_bytes());
        hex::encode(n)
    }

    fn answer(session: &str, timestamp: i64, nonce: String) -> SignalEnvelope {
        SignalEnvelope {
            session_id: session.into(),
            device_id: String::new(),
            device_name: String::new(),
            timestamp,
            nonce,
            payload: SignalPayload::Answer { sdp: SDP.into() },
        }
    }

    fn offer(device_id: &str, device_name: &str) -> SignalEnvelope {
        SignalEnvelope {
            session_id: "s1".into(),
            device_id: device_id.into(),
            device_name: device_name.into(),
            timestamp: NOW,
            nonce: nonce(1),
            payload: SignalPayload::Offer { sdp: SDP.into() },
        }
    }

    #[test]
    fn test_accepts_valid_answer() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        assert!(v.validate_at(&answer("s1", NOW, nonce(1)), NOW).is_ok());
        assert_eq!(v.remembered_nonces(), 1);
    }

    #[test]
    fn test_wrong_type_checked_first() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        // Also has a bad session and timestamp; type wins.
        let mut msg = offer("dev", "Phone");
        msg.session_id = "other".into();
        msg.timestamp = 0;
        assert_eq!(
            v.validate_at(&msg, NOW),
            Err(ValidationError::WrongMessageType {
                expected: SignalType::Answer,
                actual: SignalType::Offer
            })
        );
        assert_eq!(v.remembered_nonces(), 0);
    }

    #[test]
    fn test_session_mismatch() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        assert_eq!(
            v.validate_at(&answer("s2", NOW, nonce(1)), NOW),
            Err(ValidationError::InvalidSession)
        );
    }

    #[test]
    fn test_empty_session_matches_only_empty() {
        let v = MessageValidator::new("", SignalType::Answer);
        assert!(v.validate_at(&answer("", NOW, nonce(1)), NOW).is_ok());
        assert_eq!(
            v.validate_at(&answer("s1", NOW, nonce(2)), NOW),
            Err(ValidationError::InvalidSession)
        );

        let v = MessageValidator::new("s1", SignalType::Answer);
        assert_eq!(
            v.validate_at(&answer("", NOW, nonce(3)), NOW),
            Err(ValidationError::InvalidSession)
        );
    }

    #[test]
    fn test_timestamp_window_is_inclusive() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        assert!(v.validate_at(&answer("s1", NOW - 30, nonce(1)), NOW).is_ok());
        assert!(v.validate_at(&answer("s1", NOW + 30, nonce(2)), NOW).is_ok());
        assert_eq!(
            v.validate_at(&answer("s1", NOW - 31, nonce(3)), NOW),
            Err(ValidationError::InvalidTimestamp)
        );
        assert_eq!(
            v.validate_at(&answer("s1", NOW + 31, nonce(4)), NOW),
            Err(ValidationError::InvalidTimestamp)
        );
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        assert_eq!(
            v.validate_at(&answer("s1", i64::MIN, nonce(1)), NOW),
            Err(ValidationError::InvalidTimestamp)
        );
        assert_eq!(
            v.validate_at(&answer("s1", i64::MAX, nonce(2)), NOW),
            Err(ValidationError::InvalidTimestamp)
        );
    }

    #[test]
    fn test_nonce_must_be_16_bytes() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        assert_eq!(
            v.validate_at(&answer("s1", NOW, hex::encode([1u8; 15])), NOW),
            Err(ValidationError::InvalidNonce)
        );
        assert_eq!(
            v.validate_at(&answer("s1", NOW, "not hex at all!".into()), NOW),
            Err(ValidationError::InvalidNonce)
        );
    }

    #[test]
    fn test_replay_rejected_on_second_occurrence() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        assert!(v.validate_at(&answer("s1", NOW, nonce(7)), NOW).is_ok());
        assert_eq!(
            v.validate_at(&answer("s1", NOW, nonce(7)), NOW),
            Err(ValidationError::NonceReplay)
        );
    }

    #[test]
    fn test_101st_nonce_evicts_oldest() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        for i in 0..100 {
            assert!(v.validate_at(&answer("s1", NOW, nonce(i)), NOW).is_ok());
        }
        assert!(v.validate_at(&answer("s1", NOW, nonce(100)), NOW).is_ok());
        // Oldest evicted, valid again.
        assert!(v.validate_at(&answer("s1", NOW, nonce(0)), NOW).is_ok());
        assert_eq!(
            v.validate_at(&answer("s1", NOW, nonce(50)), NOW),
            Err(ValidationError::NonceReplay)
        );
    }

    #[test]
    fn test_clear_nonce_cache() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        v.validate_at(&answer("s1", NOW, nonce(1)), NOW).unwrap();
        v.clear_nonce_cache();
        assert!(v.validate_at(&answer("s1", NOW, nonce(1)), NOW).is_ok());
    }

    #[test]
    fn test_sdp_markers_required() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        let mut msg = answer("s1", NOW, nonce(1));
        msg.payload = SignalPayload::Answer {
            sdp: "o=- 1 2 IN IP4 127.0.0.1\r\n".into(),
        };
        assert_eq!(v.validate_at(&msg, NOW), Err(ValidationError::InvalidSdp));

        let mut msg = answer("s1", NOW, nonce(2));
        msg.payload = SignalPayload::Answer { sdp: "v=0\r\n".into() };
        assert_eq!(v.validate_at(&msg, NOW), Err(ValidationError::InvalidSdp));
    }

    #[test]
    fn test_invalid_payload_does_not_consume_nonce() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        let mut bad = answer("s1", NOW, nonce(5));
        bad.payload = SignalPayload::Answer { sdp: "v=0\r\n".into() };
        assert_eq!(v.validate_at(&bad, NOW), Err(ValidationError::InvalidSdp));
        assert_eq!(v.remembered_nonces(), 0);

        // The genuine message with the same nonce still gets through.
        assert!(v.validate_at(&answer("s1", NOW, nonce(5)), NOW).is_ok());
        assert_eq!(v.remembered_nonces(), 1);
    }

    #[test]
    fn test_invalid_messages_do_not_evict_valid_nonces() {
        let v = MessageValidator::with_limits("s1", SignalType::Answer, 30, 2);
        assert!(v.validate_at(&answer("s1", NOW, nonce(1)), NOW).is_ok());
        for i in 10..20 {
            let mut bad = answer("s1", NOW, nonce(i));
            bad.payload = SignalPayload::Answer { sdp: String::new() };
            assert_eq!(v.validate_at(&bad, NOW), Err(ValidationError::InvalidSdp));
        }
        assert_eq!(
            v.validate_at(&answer("s1", NOW, nonce(1)), NOW),
            Err(ValidationError::NonceReplay)
        );
    }

    #[test]
    fn test_replay_reported_before_payload_problems() {
        let v = MessageValidator::new("s1", SignalType::Answer);
        assert!(v.validate_at(&answer("s1", NOW, nonce(6)), NOW).is_ok());
        let mut replayed = answer("s1", NOW, nonce(6));
        replayed.payload = SignalPayload::Answer { sdp: String::new() };
        assert_eq!(v.validate_at(&replayed, NOW), Err(ValidationError::NonceReplay));
    }

    #[test]
    fn test_request_needs_device_fields() {
        let v = MessageValidator::new("s1", SignalType::Offer);
        assert!(v.validate_at(&offer("dev-1", "Phone"), NOW).is_ok());

        let v = MessageValidator::new("s1", SignalType::Offer);
        assert_eq!(
            v.validate_at(&offer("   ", "Phone"), NOW),
            Err(ValidationError::MissingDeviceId)
        );

        let v = MessageValidator::new("s1", SignalType::Offer);
        assert_eq!(
            v.validate_at(&offer("dev-1", "Pho\u{7}ne"), NOW),
            Err(ValidationError::MissingDeviceName)
        );

        let v = MessageValidator::new("s1", SignalType::Offer);
        assert_eq!(
            v.validate_at(&offer("dev-1", ""), NOW),
            Err(ValidationError::MissingDeviceName)
        );
    }

    #[test]
    fn test_pair_request_needs_device_fields() {
        let v = MessageValidator::new("s1", SignalType::PairRequest);
        let msg = SignalEnvelope {
            session_id: "s1".into(),
            device_id: String::new(),
            device_name: "Phone".into(),
            timestamp: NOW,
            nonce: nonce(9),
            payload: SignalPayload::PairRequest {
                capabilities: vec![],
            },
        };
        assert_eq!(v.validate_at(&msg, NOW), Err(ValidationError::MissingDeviceId));
    }

    #[test]
    fn test_sanitize_device_name() {
        assert_eq!(sanitize_device_name("  Kitchen\u{0}\tTablet \n"), "KitchenTablet");
        assert_eq!(sanitize_device_name("Café ☕"), "Café ☕");
        assert_eq!(sanitize_device_name("\u{1}\u{2}"), "");

        let long = "a".repeat(100);
        assert_eq!(sanitize_device_name(&long).len(), MAX_DEVICE_NAME_UNITS);
    }

    #[test]
    fn test_sanitize_never_splits_surrogate_pair() {
        // 63 ASCII units then an emoji needing two units: the emoji is dropped.
        let name = format!("{}😀", "a".repeat(63));
        let clean = sanitize_device_name(&name);
        assert_eq!(clean, "a".repeat(63));

        let name = format!("{}😀", "a".repeat(62));
        assert_eq!(sanitize_device_name(&name).encode_utf16().count(), 64);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_sanitized_name_is_bounded_and_clean(raw in "\\PC*|[\\x00-\\x1f a-z]{0,200}") {
                let clean = sanitize_device_name(&raw);
                prop_assert!(clean.encode_utf16().count() <= MAX_DEVICE_NAME_UNITS);
                prop_assert!(!clean.chars().any(is_c0_control));
                prop_assert_eq!(clean.trim(), clean.as_str());
            }

            #[test]
            fn prop_skew_within_window_accepted(skew in -30i64..=30) {
                let v = MessageValidator::new("s1", SignalType::Answer);
                prop_assert!(v.validate_at(&answer("s1", NOW + skew, nonce(1)), NOW).is_ok());
            }
        }
    }
}
