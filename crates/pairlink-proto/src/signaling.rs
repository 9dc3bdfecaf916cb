//! Signaling envelope.
//!
//! On the wire this is a flat JSON object: the common header fields plus the
//! `type` discriminator and the variant's payload fields, e.g.
//!
//! ```json
//! {"type":"answer","session_id":"ab12","device_id":"","device_name":"",
//!  "timestamp":1760000000,"nonce":"00112233445566778899aabbccddeeff","sdp":"v=0..."}
//! ```
//!
//! `device_id` is empty on responses and non-empty on requests.

use serde::{Deserialize, Serialize};

use crate::ProtoError;

/// Discriminator of a signaling message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    PairRequest,
    PairResponse,
    Capabilities,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::PairRequest => "pair_request",
            SignalType::PairResponse => "pair_response",
            SignalType::Capabilities => "capabilities",
        }
    }

    /// Requests identify the sending device.
    pub fn is_request(&self) -> bool {
        matches!(self, SignalType::Offer | SignalType::PairRequest)
    }

    /// The response type a host answers this request type with.
    pub fn response_type(&self) -> SignalType {
        match self {
            SignalType::Offer => SignalType::Answer,
            SignalType::PairRequest => SignalType::PairResponse,
            other => *other,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant-specific fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    PairRequest {
        #[serde(default)]
        capabilities: Vec<String>,
    },
    PairResponse {
        accepted: bool,
        #[serde(default)]
        hostname: String,
    },
    Capabilities {
        #[serde(default)]
        features: Vec<String>,
    },
}

impl SignalPayload {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalPayload::Offer { .. } => SignalType::Offer,
            SignalPayload::Answer { .. } => SignalType::Answer,
            SignalPayload::PairRequest { .. } => SignalType::PairRequest,
            SignalPayload::PairResponse { .. } => SignalType::PairResponse,
            SignalPayload::Capabilities { .. } => SignalType::Capabilities,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub session_id: String,
    /// Sender's device id; empty on responses.
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Hex-encoded single-use nonce (16 bytes).
    pub nonce: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn signal_type(&self) -> SignalType {
        self.payload.signal_type()
    }

    pub fn is_response(&self) -> bool {
        self.device_id.is_empty()
    }

    pub fn sdp(&self) -> Option<&str> {
        match &self.payload {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => Some(sdp),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.is_empty() {
            return Err(ProtoError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Error body returned by a direct signaling endpoint on non-2xx responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectErrorV1 {
    pub error: String,
    #[serde(default = "unknown_code")]
    pub code: String,
}

fn unknown_code() -> String {
    DirectErrorV1::UNKNOWN.to_string()
}

impl DirectErrorV1 {
    pub const UNKNOWN: &'static str = "UNKNOWN";

    /// Parse an error body; anything unparseable is reported as `UNKNOWN`.
    pub fn parse_or_unknown(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| Self {
            error: String::new(),
            code: Self::UNKNOWN.to_string(),
        })
    }
}
