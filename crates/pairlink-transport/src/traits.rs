//! Traits for the collaborators the pairing core drives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::backoff::RetryPolicy;
use crate::error::TransportError;

// ============================================================================
// Peer connection
// ============================================================================

/// Message-oriented duplex channel (the data channel of a live connection).
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Send one message
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;
    /// Receive the next message (blocking)
    async fn recv(&self) -> Result<Bytes, TransportError>;
}

/// A live point-to-point connection being negotiated.
#[async_trait]
pub trait PeerConnection: DuplexChannel {
    /// Create the local session description to send to the peer
    async fn create_offer(&self) -> Result<String, TransportError>;
    /// Apply the peer's answer
    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError>;
    /// Wait until the data channel is open
    async fn wait_for_data_channel(&self, timeout: Duration) -> Result<(), TransportError>;
    /// Tear the connection down. Implementations may be called at most once by
    /// the ownership layer, but must tolerate repeated calls.
    fn close(&self);
}

/// Factory for new peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

// ============================================================================
// Relay (pub/sub)
// ============================================================================

/// Event name carrying a published payload.
pub const RELAY_EVENT_MESSAGE: &str = "message";

/// One event from a relay subscription stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEvent {
    /// Event kind; only `"message"` carries a payload
    pub event: String,
    pub payload: String,
}

impl RelayEvent {
    pub fn message(payload: impl Into<String>) -> Self {
        Self {
            event: RELAY_EVENT_MESSAGE.to_string(),
            payload: payload.into(),
        }
    }

    pub fn keepalive() -> Self {
        Self {
            event: "keepalive".to_string(),
            payload: String::new(),
        }
    }

    pub fn is_message(&self) -> bool {
        self.event == RELAY_EVENT_MESSAGE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A confirmed-connected subscription.
pub struct RelaySubscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// Topic-based message broker client.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Subscribe to `topic`. Returns only once the subscription is connected, so
    /// anything published afterwards is delivered.
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, TransportError>;

    /// Publish a payload to `topic`
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError>;

    /// Release a subscription. Synchronous so it can run from drop guards.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Publish, retrying retriable errors up to `max_retries` times.
    async fn publish_with_retry(
        &self,
        topic: &str,
        payload: &str,
        max_retries: u32,
    ) -> Result<(), TransportError> {
        let policy = RetryPolicy::default();
        let mut attempt = 0;
        loop {
            match self.publish(topic, payload).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() && attempt < max_retries => {
                    tokio::time::sleep(policy.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Direct signaling
// ============================================================================

/// Host address advertised in the QR invite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectTarget {
    pub host: String,
    pub port: u16,
}

/// A signed `POST /signal/{session_id}` request.
#[derive(Clone, Debug)]
pub struct DirectRequest {
    pub session_id: String,
    /// Sealed signaling envelope (base64)
    pub body: String,
    /// `X-Signature`: hex HMAC over session_id || timestamp || body
    pub signature: String,
    /// `X-Timestamp`: unix seconds
    pub timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct DirectResponse {
    pub status: u16,
    pub body: String,
}

impl DirectResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Point-to-point signaling endpoint on the host.
#[async_trait]
pub trait DirectSignalClient: Send + Sync {
    async fn post_signal(
        &self,
        target: &DirectTarget,
        request: &DirectRequest,
    ) -> Result<DirectResponse, TransportError>;
}
