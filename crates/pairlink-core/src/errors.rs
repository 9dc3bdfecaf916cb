//! Error types for the pairing core.
//!
//! Each layer has its own `thiserror` enum; `CoreError` unifies them for the
//! lifecycle, which in turn reduces every terminal error to one
//! [`FailureReason`]. Nothing below this module's public surface carries wire
//! detail to callers.

use thiserror::Error;

use pairlink_crypto::CryptoError;
use pairlink_proto::v1::{AuthErrorCodeV1, SignalType};
use pairlink_proto::ProtoError;
use pairlink_transport::TransportError;

use crate::config::ConfigError;
use crate::ownership::LifecycleState;
use crate::store::StoreError;

// ============================================================================
// Layer Errors
// ============================================================================

/// Rejection reasons from `MessageValidator`, in check order.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("wrong message type: expected {expected}, got {actual}")]
    WrongMessageType {
        expected: SignalType,
        actual: SignalType,
    },

    #[error("session id mismatch")]
    InvalidSession,

    #[error("timestamp outside acceptance window")]
    InvalidTimestamp,

    #[error("malformed nonce")]
    InvalidNonce,

    #[error("nonce already seen")]
    NonceReplay,

    #[error("session description missing version or media line")]
    InvalidSdp,

    #[error("missing device id")]
    MissingDeviceId,

    #[error("missing device name")]
    MissingDeviceName,
}

impl ValidationError {
    /// Stable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::WrongMessageType { .. } => "WRONG_MESSAGE_TYPE",
            ValidationError::InvalidSession => "INVALID_SESSION",
            ValidationError::InvalidTimestamp => "INVALID_TIMESTAMP",
            ValidationError::InvalidNonce => "INVALID_NONCE",
            ValidationError::NonceReplay => "NONCE_REPLAY",
            ValidationError::InvalidSdp => "INVALID_SDP",
            ValidationError::MissingDeviceId => "MISSING_DEVICE_ID",
            ValidationError::MissingDeviceName => "MISSING_DEVICE_NAME",
        }
    }
}

/// Handshake failures other than timeout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("challenge nonce has wrong length")]
    InvalidNonce,

    #[error("hmac verification failed")]
    InvalidHmac,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote reported {}", .0.as_str())]
    Remote(AuthErrorCodeV1),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("connection already disposed")]
    Disposed,

    #[error("ownership cannot be transferred to Disposed")]
    DisposedTarget,

    #[error("caller does not own the connection")]
    NotOwner,

    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// QR invite decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QrError {
    #[error("not a pairing invite: {0}")]
    InvalidUri(String),

    #[error("unsupported invite version: {0}")]
    UnsupportedVersion(String),

    #[error("invite missing field: {0}")]
    MissingField(&'static str),

    #[error("invite secret is malformed")]
    InvalidSecret,

    #[error("invite port is malformed")]
    InvalidPort,
}

/// Coarse category of a signaling failure that is neither a timeout nor an
/// authorization rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingErrorKind {
    /// The outgoing envelope could not be serialized or sealed
    Encode,
    /// Direct path failed and no relay is configured
    Direct,
    RelaySubscribe,
    RelayPublish,
    /// Relay event stream ended before a response arrived
    RelayDisconnected,
    /// Neither a direct target nor a relay is available
    NoPath,
}

impl std::fmt::Display for SignalingErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalingErrorKind::Encode => "encode",
            SignalingErrorKind::Direct => "direct",
            SignalingErrorKind::RelaySubscribe => "relay_subscribe",
            SignalingErrorKind::RelayPublish => "relay_publish",
            SignalingErrorKind::RelayDisconnected => "relay_disconnected",
            SignalingErrorKind::NoPath => "no_path",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Unified Core Error
// ============================================================================

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("decode error: {0}")]
    Proto(#[from] ProtoError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("ownership error: {0}")]
    Ownership(#[from] OwnershipError),

    #[error("invalid invite: {0}")]
    Qr(#[from] QrError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("signaling failed ({kind}): {detail}")]
    Signaling {
        kind: SignalingErrorKind,
        detail: String,
    },

    #[error("remote rejected the request")]
    Unauthorized,

    #[error("timeout: operation timed out")]
    Timeout,

    #[error("cancelled: operation cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Generic text shown for every failure that could leak information about
/// the shared secret.
pub const AUTH_FAILED_MESSAGE: &str = "Authentication failed";

impl CoreError {
    /// True for failures an attacker could use as an oracle on the secret:
    /// MAC mismatch, decryption failure, nonce replay.
    pub fn is_security_sensitive(&self) -> bool {
        match self {
            CoreError::Crypto(CryptoError::DecryptionFailed) => true,
            CoreError::Handshake(HandshakeError::InvalidHmac) => true,
            CoreError::Handshake(HandshakeError::InvalidNonce) => true,
            CoreError::Validation(ValidationError::NonceReplay) => true,
            CoreError::Validation(ValidationError::InvalidNonce) => true,
            CoreError::Unauthorized => true,
            _ => false,
        }
    }

    /// Text safe to surface outside the process (UI, remote peer).
    ///
    /// Security-sensitive failures all collapse to the same string.
    pub fn public_message(&self) -> &'static str {
        if self.is_security_sensitive() {
            return AUTH_FAILED_MESSAGE;
        }
        match self {
            CoreError::Handshake(_) => AUTH_FAILED_MESSAGE,
            CoreError::Qr(_) => "Invalid pairing code",
            CoreError::Timeout => "Timed out",
            CoreError::Cancelled => "Cancelled",
            CoreError::Transport(_) | CoreError::Signaling { .. } => "Could not reach the other device",
            _ => "Pairing failed",
        }
    }
}

// ============================================================================
// Failure Reasons
// ============================================================================

/// Why a pairing attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    QrParseError,
    SignalingFailed,
    DirectTimeout,
    RelaySubscribeFailed,
    RelayTimeout,
    ConnectionFailed,
    AuthFailed,
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::QrParseError => "qr_parse_error",
            FailureReason::SignalingFailed => "signaling_failed",
            FailureReason::DirectTimeout => "direct_timeout",
            FailureReason::RelaySubscribeFailed => "relay_subscribe_failed",
            FailureReason::RelayTimeout => "relay_timeout",
            FailureReason::ConnectionFailed => "connection_failed",
            FailureReason::AuthFailed => "auth_failed",
            FailureReason::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SignalingErrorKind> for FailureReason {
    fn from(kind: SignalingErrorKind) -> Self {
        match kind {
            SignalingErrorKind::RelaySubscribe => FailureReason::RelaySubscribeFailed,
            _ => FailureReason::SignalingFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_sensitive_errors_share_public_message() {
        let errors = [
            CoreError::Crypto(CryptoError::DecryptionFailed),
            CoreError::Handshake(HandshakeError::InvalidHmac),
            CoreError::Validation(ValidationError::NonceReplay),
            CoreError::Unauthorized,
        ];
        for e in &errors {
            assert!(e.is_security_sensitive());
            assert_eq!(e.public_message(), AUTH_FAILED_MESSAGE);
        }
    }

    #[test]
    fn test_public_message_hides_detail() {
        let e = CoreError::Signaling {
            kind: SignalingErrorKind::RelayPublish,
            detail: "broker at 10.0.0.7 said 500".into(),
        };
        assert!(!e.public_message().contains("10.0.0.7"));
        assert!(!e.is_security_sensitive());
    }

    #[test]
    fn test_signaling_kind_maps_to_reason() {
        assert_eq!(
            FailureReason::from(SignalingErrorKind::RelaySubscribe),
            FailureReason::RelaySubscribeFailed
        );
        assert_eq!(
            FailureReason::from(SignalingErrorKind::RelayPublish),
            FailureReason::SignalingFailed
        );
    }

    #[test]
    fn test_validation_codes() {
        assert_eq!(ValidationError::NonceReplay.code(), "NONCE_REPLAY");
        assert_eq!(
            ValidationError::WrongMessageType {
                expected: SignalType::Answer,
                actual: SignalType::Offer
            }
            .code(),
            "WRONG_MESSAGE_TYPE"
        );
    }
}
