//! Auth handshake envelope.
//!
//! Hand-maintained prost definitions equivalent to:
//!
//! ```proto
//! message AuthEnvelopeV1 {
//!   oneof kind {
//!     AuthChallengeV1 challenge = 1;
//!     AuthResponseV1  response  = 2;
//!     AuthVerifyV1    verify    = 3;
//!     AuthSuccessV1   success   = 4;
//!     AuthErrorV1     error     = 5;
//!   }
//! }
//! ```
//!
//! Exactly one kind is present per envelope, so "has challenge" and "has error"
//! can never both hold.

use prost::Message;

use crate::ProtoError;

#[derive(Clone, PartialEq, Message)]
pub struct AuthEnvelopeV1 {
    #[prost(oneof = "auth_envelope_v1::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<auth_envelope_v1::Kind>,
}

pub mod auth_envelope_v1 {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Challenge(super::AuthChallengeV1),
        #[prost(message, tag = "2")]
        Response(super::AuthResponseV1),
        #[prost(message, tag = "3")]
        Verify(super::AuthVerifyV1),
        #[prost(message, tag = "4")]
        Success(super::AuthSuccessV1),
        #[prost(message, tag = "5")]
        Error(super::AuthErrorV1),
    }
}

/// Step 1, host → client.
#[derive(Clone, PartialEq, Message)]
pub struct AuthChallengeV1 {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
}

/// Step 2, client → host.
#[derive(Clone, PartialEq, Message)]
pub struct AuthResponseV1 {
    /// HMAC(auth_key, challenge nonce)
    #[prost(bytes = "vec", tag = "1")]
    pub hmac: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
}

/// Step 3, host → client.
#[derive(Clone, PartialEq, Message)]
pub struct AuthVerifyV1 {
    /// HMAC(auth_key, client nonce)
    #[prost(bytes = "vec", tag = "1")]
    pub hmac: Vec<u8>,
}

/// Step 4, host → client.
#[derive(Clone, PartialEq, Message)]
pub struct AuthSuccessV1 {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "3")]
    pub device_type: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AuthErrorV1 {
    #[prost(enumeration = "AuthErrorCodeV1", tag = "1")]
    pub code: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum AuthErrorCodeV1 {
    Unspecified = 0,
    InvalidNonce = 1,
    InvalidHmac = 2,
    ProtocolError = 3,
    Timeout = 4,
    Rejected = 5,
}

impl AuthErrorCodeV1 {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorCodeV1::Unspecified => "UNSPECIFIED",
            AuthErrorCodeV1::InvalidNonce => "INVALID_NONCE",
            AuthErrorCodeV1::InvalidHmac => "INVALID_HMAC",
            AuthErrorCodeV1::ProtocolError => "PROTOCOL_ERROR",
            AuthErrorCodeV1::Timeout => "TIMEOUT",
            AuthErrorCodeV1::Rejected => "REJECTED",
        }
    }
}

impl AuthEnvelopeV1 {
    pub fn challenge(nonce: Vec<u8>) -> Self {
        Self::wrap(auth_envelope_v1::Kind::Challenge(AuthChallengeV1 { nonce }))
    }

    pub fn response(hmac: Vec<u8>, nonce: Vec<u8>) -> Self {
        Self::wrap(auth_envelope_v1::Kind::Response(AuthResponseV1 { hmac, nonce }))
    }

    pub fn verify(hmac: Vec<u8>) -> Self {
        Self::wrap(auth_envelope_v1::Kind::Verify(AuthVerifyV1 { hmac }))
    }

    pub fn success(
        device_id: impl Into<String>,
        hostname: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self::wrap(auth_envelope_v1::Kind::Success(AuthSuccessV1 {
            device_id: device_id.into(),
            hostname: hostname.into(),
            device_type: device_type.into(),
        }))
    }

    pub fn error(code: AuthErrorCodeV1) -> Self {
        Self::wrap(auth_envelope_v1::Kind::Error(AuthErrorV1 { code: code as i32 }))
    }

    fn wrap(kind: auth_envelope_v1::Kind) -> Self {
        Self { kind: Some(kind) }
    }

    /// Encode with a varint length prefix.
    pub fn to_wire(&self) -> Vec<u8> {
        self.encode_length_delimited_to_vec()
    }

    /// Decode a length-prefixed envelope. An envelope without a kind is rejected.
    pub fn from_wire(bytes: &[u8]) -> Result<auth_envelope_v1::Kind, ProtoError> {
        if bytes.is_empty() {
            return Err(ProtoError::Empty);
        }
        let envelope = Self::decode_length_delimited(bytes)?;
        envelope.kind.ok_or(ProtoError::MissingKind)
    }
}

#[cfg(test)]
mod tests {
    use super::auth_envelope_v1::Kind;
    use super::*;

    #[test]
    fn test_challenge_wire() {
        let bytes = AuthEnvelopeV1::challenge(vec![7u8; 32]).to_wire();
        match AuthEnvelopeV1::from_wire(&bytes).unwrap() {
            Kind::Challenge(c) => assert_eq!(c.nonce, vec![7u8; 32]),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_error_code_survives() {
        let bytes = AuthEnvelopeV1::error(AuthErrorCodeV1::InvalidHmac).to_wire();
        match AuthEnvelopeV1::from_wire(&bytes).unwrap() {
            Kind::Error(e) => assert_eq!(e.code(), AuthErrorCodeV1::InvalidHmac),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_empty_bytes_rejected() {
        assert!(matches!(AuthEnvelopeV1::from_wire(&[]), Err(ProtoError::Empty)));
    }

    #[test]
    fn test_envelope_without_kind_rejected() {
        let bytes = AuthEnvelopeV1 { kind: None }.to_wire();
        assert!(matches!(
            AuthEnvelopeV1::from_wire(&bytes),
            Err(ProtoError::MissingKind)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        // Length prefix claims 100 bytes, only 3 follow.
        assert!(AuthEnvelopeV1::from_wire(&[100, 1, 2, 3]).is_err());
    }
}
