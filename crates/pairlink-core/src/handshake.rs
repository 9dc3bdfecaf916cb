//! Mutual-proof authentication over an open duplex channel.
//!
//! ```text
//!   host                               client
//!    |-- Challenge{nonce_s} ------------->|
//!    |<-- Response{HMAC(k, nonce_s), nonce_c}
//!    |-- Verify{HMAC(k, nonce_c)} ------->|
//!    |-- Success{device_id, ...} -------->|
//! ```
//!
//! `k` is the auth key derived from the shared secret. Each side proves it
//! holds the secret by MACing the other side's fresh nonce.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use pairlink_crypto::mac::{hmac_sha256, verify_hmac};
use pairlink_crypto::utils::random_bytes;
use pairlink_crypto::DerivedKey;
use pairlink_proto::sizes::AUTH_NONCE_SIZE;
use pairlink_proto::v1::{auth_envelope_v1::Kind, AuthEnvelopeV1, AuthErrorCodeV1};
use pairlink_transport::DuplexChannel;

use crate::errors::HandshakeError;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity the host announces in its Success message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub device_id: String,
    pub hostname: String,
    pub device_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Success(RemoteIdentity),
    Failed(HandshakeError),
    /// The overall deadline passed; never reported as a protocol error
    Timeout,
}

/// Client side of the handshake.
pub struct AuthHandshake {
    auth_key: DerivedKey,
    timeout: Duration,
}

impl AuthHandshake {
    pub fn new(auth_key: DerivedKey) -> Self {
        Self {
            auth_key,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run all four steps under one deadline.
    pub async fn run<C>(&self, channel: &C) -> HandshakeOutcome
    where
        C: DuplexChannel + ?Sized,
    {
        match tokio::time::timeout(self.timeout, self.run_steps(channel)).await {
            Ok(Ok(identity)) => {
                debug!(device_id = %identity.device_id, "handshake succeeded");
                HandshakeOutcome::Success(identity)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "handshake failed");
                HandshakeOutcome::Failed(e)
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "handshake timed out");
                HandshakeOutcome::Timeout
            }
        }
    }

    async fn run_steps<C>(&self, channel: &C) -> Result<RemoteIdentity, HandshakeError>
    where
        C: DuplexChannel + ?Sized,
    {
        let key = self.auth_key.as_bytes();

        // 1. Challenge
        let challenge = match recv_kind(channel).await? {
            Kind::Challenge(c) => c,
            other => return Err(unexpected("challenge", &other)),
        };
        if challenge.nonce.len() != AUTH_NONCE_SIZE {
            return Err(HandshakeError::InvalidNonce);
        }

        // 2. Response
        let client_hmac = hmac_sha256(key, &challenge.nonce);
        let client_nonce = random_bytes::<AUTH_NONCE_SIZE>()
            .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
        send_envelope(
            channel,
            AuthEnvelopeV1::response(client_hmac.to_vec(), client_nonce.to_vec()),
        )
        .await?;

        // 3. Verify (or a propagated error)
        match recv_kind(channel).await? {
            Kind::Verify(v) => {
                if !verify_hmac(key, &client_nonce, &v.hmac) {
                    return Err(HandshakeError::InvalidHmac);
                }
            }
            Kind::Error(e) => return Err(HandshakeError::Remote(e.code())),
            other => return Err(unexpected("verify", &other)),
        }

        // 4. Success
        match recv_kind(channel).await? {
            Kind::Success(s) => Ok(RemoteIdentity {
                device_id: s.device_id,
                hostname: s.hostname,
                device_type: s.device_type,
            }),
            other => Err(unexpected("success", &other)),
        }
    }
}

// ============================================================================
// Host Side
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponderOutcome {
    Accepted,
    Failed(HandshakeError),
    Timeout,
}

/// Host side of the handshake: issues the challenge and proves itself back.
pub struct AuthResponder {
    auth_key: DerivedKey,
    identity: RemoteIdentity,
    timeout: Duration,
}

impl AuthResponder {
    /// `identity` is what this host announces to the client.
    pub fn new(auth_key: DerivedKey, identity: RemoteIdentity) -> Self {
        Self {
            auth_key,
            identity,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run<C>(&self, channel: &C) -> ResponderOutcome
    where
        C: DuplexChannel + ?Sized,
    {
        match tokio::time::timeout(self.timeout, self.run_steps(channel)).await {
            Ok(Ok(())) => ResponderOutcome::Accepted,
            Ok(Err(e)) => {
                warn!(error = %e, "client failed authentication");
                ResponderOutcome::Failed(e)
            }
            Err(_) => ResponderOutcome::Timeout,
        }
    }

    async fn run_steps<C>(&self, channel: &C) -> Result<(), HandshakeError>
    where
        C: DuplexChannel + ?Sized,
    {
        let key = self.auth_key.as_bytes();
        let server_nonce = random_bytes::<AUTH_NONCE_SIZE>()
            .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
        send_envelope(channel, AuthEnvelopeV1::challenge(server_nonce.to_vec())).await?;

        let response = match recv_kind(channel).await {
            Ok(Kind::Response(r)) => r,
            Ok(other) => {
                let err = unexpected("response", &other);
                reject(channel).await;
                return Err(err);
            }
            Err(e) => {
                reject(channel).await;
                return Err(e);
            }
        };

        if !verify_hmac(key, &server_nonce, &response.hmac) {
            reject(channel).await;
            return Err(HandshakeError::InvalidHmac);
        }
        if response.nonce.len() != AUTH_NONCE_SIZE {
            reject(channel).await;
            return Err(HandshakeError::InvalidNonce);
        }

        let proof = hmac_sha256(key, &response.nonce);
        send_envelope(channel, AuthEnvelopeV1::verify(proof.to_vec())).await?;
        send_envelope(
            channel,
            AuthEnvelopeV1::success(
                self.identity.device_id.clone(),
                self.identity.hostname.clone(),
                self.identity.device_type.clone(),
            ),
        )
        .await
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn recv_kind<C>(channel: &C) -> Result<Kind, HandshakeError>
where
    C: DuplexChannel + ?Sized,
{
    let bytes = channel
        .recv()
        .await
        .map_err(|e| HandshakeError::Protocol(format!("receive failed: {}", e)))?;
    AuthEnvelopeV1::from_wire(&bytes)
        .map_err(|e| HandshakeError::Protocol(format!("malformed message: {}", e)))
}

async fn send_envelope<C>(channel: &C, envelope: AuthEnvelopeV1) -> Result<(), HandshakeError>
where
    C: DuplexChannel + ?Sized,
{
    channel
        .send(Bytes::from(envelope.to_wire()))
        .await
        .map_err(|e| HandshakeError::Protocol(format!("send failed: {}", e)))
}

/// Tell the client it was refused. Every rejection carries the same code;
/// the specific reason stays in the local outcome. Best effort: the peer may
/// already be gone.
async fn reject<C>(channel: &C)
where
    C: DuplexChannel + ?Sized,
{
    let _ = channel
        .send(Bytes::from(AuthEnvelopeV1::error(AuthErrorCodeV1::Rejected).to_wire()))
        .await;
}

fn unexpected(expected: &str, got: &Kind) -> HandshakeError {
    let name = match got {
        Kind::Challenge(_) => "challenge",
        Kind::Response(_) => "response",
        Kind::Verify(_) => "verify",
        Kind::Success(_) => "success",
        Kind::Error(_) => "error",
    };
    HandshakeError::Protocol(format!("expected {}, got {}", expected, name))
}
