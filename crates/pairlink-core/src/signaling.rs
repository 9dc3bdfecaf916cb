//! Encrypted signaling exchange.
//!
//! A request envelope (an offer, or a pair request) is sealed with the
//! signaling key and delivered to the host, and the first genuine response is
//! returned. Delivery tries the direct path first when the invite carried a
//! host address, then falls back to the relay:
//!
//! 1. Direct: one signed `POST /signal/{session}` bounded by the direct timeout.
//!    401/403 ends the exchange as `AuthFailed`; any other failure falls through.
//! 2. Relay: subscribe, wait for the subscription to be connected, then publish
//!    the sealed request once. Retriable subscribe/publish errors restart the
//!    attempt after a backoff, up to the retry limit. Each attempt, from
//!    subscribe to the first response, is bounded by the relay timeout.
//! 3. Relay events are filtered: non-message events are ignored, payloads that
//!    fail to open or validate are dropped silently, and echoes of our own
//!    request (non-empty device id) are skipped.
//!
//! `cancel` may be called from any task while an exchange is in flight; the
//! relay subscription is owned by a guard and released however the exchange
//! ends.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use pairlink_crypto::mac::hmac_sha256_parts;
use pairlink_crypto::message_crypto::MessageCrypto;
use pairlink_crypto::utils::{constant_time_compare, random_bytes};
use pairlink_crypto::{CryptoError, DerivedKey};
use pairlink_proto::sizes::SIGNAL_NONCE_SIZE;
use pairlink_proto::v1::{DirectErrorV1, SignalEnvelope, SignalPayload, SignalType};
use pairlink_transport::{
    DirectRequest, DirectSignalClient, DirectTarget, RelayEvent, RelayTransport, RetryPolicy,
    SubscriptionId, TransportError,
};

use crate::config::PairingConfig;
use crate::errors::{CoreError, SignalingErrorKind, ValidationError};
use crate::keys::SessionKeys;
use crate::validator::{unix_now, MessageValidator};

// ============================================================================
// Codec
// ============================================================================

/// JSON → AEAD → base64, and back.
#[derive(Clone, Debug)]
pub struct SignalCodec {
    crypto: MessageCrypto,
}

impl SignalCodec {
    pub fn new(signaling_key: &DerivedKey) -> Self {
        Self {
            crypto: MessageCrypto::new(signaling_key),
        }
    }

    pub fn seal(&self, envelope: &SignalEnvelope) -> Result<String, CoreError> {
        let json = envelope.to_json()?;
        let blob = self.crypto.encrypt(&json)?;
        Ok(STANDARD.encode(blob))
    }

    /// Every failure to open is reported as `DecryptionFailed`, whether the
    /// payload was bad base64, failed authentication or held invalid JSON.
    pub fn open(&self, payload: &str) -> Result<SignalEnvelope, CoreError> {
        let blob = STANDARD
            .decode(payload.trim())
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let json = self.crypto.decrypt(&blob)?;
        SignalEnvelope::from_json(&json).map_err(|_| CryptoError::DecryptionFailed.into())
    }
}

/// Fresh hex-encoded 16-byte signaling nonce.
pub fn new_signal_nonce() -> Result<String, CryptoError> {
    Ok(hex::encode(random_bytes::<SIGNAL_NONCE_SIZE>()?))
}

/// Build a request envelope (carries the sender's device identity).
pub fn build_request(
    session_id: &str,
    device_id: &str,
    device_name: &str,
    payload: SignalPayload,
) -> Result<SignalEnvelope, CryptoError> {
    Ok(SignalEnvelope {
        session_id: session_id.to_string(),
        device_id: device_id.to_string(),
        device_name: device_name.to_string(),
        timestamp: unix_now(),
        nonce: new_signal_nonce()?,
        payload,
    })
}

/// Build a response envelope (empty device identity).
pub fn build_response(session_id: &str, payload: SignalPayload) -> Result<SignalEnvelope, CryptoError> {
    build_request(session_id, "", "", payload)
}

// ============================================================================
// Direct Request Signing
// ============================================================================

/// Sign a sealed body for `POST /signal/{session_id}`.
///
/// Signature: hex(HMAC(auth_key, session_id || timestamp || body)), with the
/// timestamp in decimal unix seconds.
pub fn sign_direct_request(
    auth_key: &DerivedKey,
    session_id: &str,
    body: &str,
    timestamp: i64,
) -> DirectRequest {
    let ts = timestamp.to_string();
    let mac = hmac_sha256_parts(
        auth_key.as_bytes(),
        &[session_id.as_bytes(), ts.as_bytes(), body.as_bytes()],
    );
    DirectRequest {
        session_id: session_id.to_string(),
        body: body.to_string(),
        signature: hex::encode(mac),
        timestamp,
    }
}

/// Check a direct request's signature and freshness.
pub fn verify_direct_request(
    auth_key: &DerivedKey,
    request: &DirectRequest,
    now: i64,
    window_secs: i64,
) -> bool {
    let skew = request.timestamp.saturating_sub(now);
    if skew < -window_secs || skew > window_secs {
        return false;
    }
    let Ok(signature) = hex::decode(&request.signature) else {
        return false;
    };
    let ts = request.timestamp.to_string();
    let expected = hmac_sha256_parts(
        auth_key.as_bytes(),
        &[request.session_id.as_bytes(), ts.as_bytes(), request.body.as_bytes()],
    );
    constant_time_compare(&expected, &signature)
}

// ============================================================================
// Exchange Types
// ============================================================================

#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    pub direct_timeout: Duration,
    /// Bound on one relay attempt: subscribe, publish and the wait
    pub relay_timeout: Duration,
    pub max_retries: u32,
    pub retry: RetryPolicy,
    pub timestamp_window_secs: i64,
    pub nonce_cache_capacity: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::from(&PairingConfig::default())
    }
}

impl From<&PairingConfig> for ExchangeConfig {
    fn from(config: &PairingConfig) -> Self {
        Self {
            direct_timeout: config.timeouts.direct(),
            relay_timeout: config.timeouts.relay(),
            max_retries: config.relay.max_retries,
            retry: config.relay.retry_policy(),
            timestamp_window_secs: config.validation.timestamp_window_secs,
            nonce_cache_capacity: config.validation.nonce_cache_capacity,
        }
    }
}

/// What to send and where.
#[derive(Clone, Debug)]
pub struct ExchangeRequest {
    pub envelope: SignalEnvelope,
    pub direct_target: Option<DirectTarget>,
    pub relay_topic: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Success {
        envelope: SignalEnvelope,
        used_direct_path: bool,
        used_relay_path: bool,
    },
    Timeout,
    AuthFailed,
    Error {
        kind: SignalingErrorKind,
        detail: String,
    },
    Cancelled,
}

/// Progress notifications from an exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeEvent {
    DirectStarted,
    DirectRequestSent,
    /// Falling back to the relay after the direct path failed
    DirectFailed,
    RelaySubscribing { attempt: u32 },
    RelayWaiting,
    RelayRetry {
        attempt: u32,
        max_retries: u32,
        delay: Duration,
    },
}

pub type ExchangeCallback = Arc<dyn Fn(ExchangeEvent) + Send + Sync>;

enum DirectResult {
    Answered(SignalEnvelope),
    Unauthorized,
    TimedOut,
    Failed(String),
}

#[derive(Clone, Copy, Debug)]
enum RelayStage {
    Subscribe,
    Publish,
    Wait,
}

impl RelayStage {
    fn kind(self) -> SignalingErrorKind {
        match self {
            RelayStage::Subscribe => SignalingErrorKind::RelaySubscribe,
            RelayStage::Publish => SignalingErrorKind::RelayPublish,
            RelayStage::Wait => SignalingErrorKind::RelayDisconnected,
        }
    }
}

/// Unsubscribes when dropped.
struct SubscriptionGuard {
    relay: Arc<dyn RelayTransport>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        trace!(id = self.id.0, "releasing relay subscription");
        self.relay.unsubscribe(self.id);
    }
}

// ============================================================================
// Exchanger
// ============================================================================

pub struct SignalingExchanger {
    codec: SignalCodec,
    auth_key: DerivedKey,
    direct: Option<Arc<dyn DirectSignalClient>>,
    relay: Option<Arc<dyn RelayTransport>>,
    config: ExchangeConfig,
    progress: Option<ExchangeCallback>,
    cancel_tx: watch::Sender<bool>,
}

impl SignalingExchanger {
    pub fn new(keys: &SessionKeys, config: ExchangeConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            codec: SignalCodec::new(&keys.signaling),
            auth_key: keys.auth.clone(),
            direct: None,
            relay: None,
            config,
            progress: None,
            cancel_tx,
        }
    }

    pub fn with_direct(mut self, client: Arc<dyn DirectSignalClient>) -> Self {
        self.direct = Some(client);
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelayTransport>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_progress(mut self, callback: ExchangeCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn has_relay(&self) -> bool {
        self.relay.is_some()
    }

    /// Abort an in-flight exchange. Later calls to `exchange` return
    /// `Cancelled` immediately.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Deliver `request` and wait for the matching response.
    pub async fn exchange(&self, request: &ExchangeRequest) -> ExchangeOutcome {
        let mut cancel_rx = self.cancel_tx.subscribe();
        if *cancel_rx.borrow_and_update() {
            return ExchangeOutcome::Cancelled;
        }

        let expected = request.envelope.signal_type().response_type();
        let validator = MessageValidator::with_limits(
            request.envelope.session_id.clone(),
            expected,
            self.config.timestamp_window_secs,
            self.config.nonce_cache_capacity,
        );

        let sealed = match self.codec.seal(&request.envelope) {
            Ok(sealed) => sealed,
            Err(e) => {
                return ExchangeOutcome::Error {
                    kind: SignalingErrorKind::Encode,
                    detail: e.to_string(),
                }
            }
        };

        tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel_rx) => {
                info!("signaling exchange cancelled");
                ExchangeOutcome::Cancelled
            }
            outcome = self.run_paths(request, &sealed, &validator) => outcome,
        }
    }

    async fn run_paths(
        &self,
        request: &ExchangeRequest,
        sealed: &str,
        validator: &MessageValidator,
    ) -> ExchangeOutcome {
        let mut direct_failure = None;

        if let (Some(client), Some(target)) = (&self.direct, &request.direct_target) {
            match self
                .try_direct(client.as_ref(), target, &request.envelope.session_id, sealed, validator)
                .await
            {
                DirectResult::Answered(envelope) => {
                    info!("signaling answered over direct path");
                    return ExchangeOutcome::Success {
                        envelope,
                        used_direct_path: true,
                        used_relay_path: false,
                    };
                }
                DirectResult::Unauthorized => {
                    warn!("direct signaling rejected as unauthorized");
                    return ExchangeOutcome::AuthFailed;
                }
                other => {
                    self.emit(ExchangeEvent::DirectFailed);
                    direct_failure = Some(other);
                }
            }
        }

        match (&self.relay, direct_failure) {
            (Some(relay), _) => self.relay_exchange(relay, &request.relay_topic, sealed, validator).await,
            (None, Some(DirectResult::TimedOut)) => ExchangeOutcome::Timeout,
            (None, Some(DirectResult::Failed(detail))) => ExchangeOutcome::Error {
                kind: SignalingErrorKind::Direct,
                detail,
            },
            (None, _) => ExchangeOutcome::Error {
                kind: SignalingErrorKind::NoPath,
                detail: "no direct target and no relay configured".to_string(),
            },
        }
    }

    // ------------------------------------------------------------------------
    // Direct path
    // ------------------------------------------------------------------------

    async fn try_direct(
        &self,
        client: &dyn DirectSignalClient,
        target: &DirectTarget,
        session_id: &str,
        sealed: &str,
        validator: &MessageValidator,
    ) -> DirectResult {
        self.emit(ExchangeEvent::DirectStarted);
        let request = sign_direct_request(&self.auth_key, session_id, sealed, unix_now());

        debug!(host = %target.host, port = target.port, "trying direct signaling");
        self.emit(ExchangeEvent::DirectRequestSent);
        let response =
            match tokio::time::timeout(self.config.direct_timeout, client.post_signal(target, &request)).await {
                Err(_) | Ok(Err(TransportError::Timeout)) => {
                    debug!("direct signaling timed out");
                    return DirectResult::TimedOut;
                }
                Ok(Err(TransportError::Unauthorized(_))) => return DirectResult::Unauthorized,
                Ok(Err(e)) => {
                    debug!(error = %e, "direct signaling failed");
                    return DirectResult::Failed(e.to_string());
                }
                Ok(Ok(response)) => response,
            };

        if response.status == 401 || response.status == 403 {
            return DirectResult::Unauthorized;
        }
        if !response.is_success() {
            let error = DirectErrorV1::parse_or_unknown(response.body.as_bytes());
            debug!(status = response.status, code = %error.code, "direct signaling refused");
            return DirectResult::Failed(format!("status {} ({})", response.status, error.code));
        }

        let body = response.body.trim();
        if body.is_empty() {
            return DirectResult::Failed("empty reply".to_string());
        }
        match self.accept_response(body, validator) {
            Some(envelope) => DirectResult::Answered(envelope),
            None => DirectResult::Failed("invalid reply".to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Relay path
    // ------------------------------------------------------------------------

    async fn relay_exchange(
        &self,
        relay: &Arc<dyn RelayTransport>,
        topic: &str,
        sealed: &str,
        validator: &MessageValidator,
    ) -> ExchangeOutcome {
        let max_retries = self.config.max_retries;
        let mut attempt = 0u32;
        loop {
            self.emit(ExchangeEvent::RelaySubscribing { attempt });
            match self.relay_attempt(relay, topic, sealed, validator).await {
                Ok(Some(envelope)) => {
                    info!(attempt, "signaling answered over relay");
                    return ExchangeOutcome::Success {
                        envelope,
                        used_direct_path: false,
                        used_relay_path: true,
                    };
                }
                Ok(None) => {
                    warn!(
                        timeout_secs = self.config.relay_timeout.as_secs(),
                        "no relay response before timeout"
                    );
                    return ExchangeOutcome::Timeout;
                }
                Err((stage, error)) if error.is_retriable() && attempt < max_retries => {
                    let delay = self.config.retry.backoff_delay(attempt);
                    attempt += 1;
                    warn!(?stage, error = %error, attempt, max_retries, "relay operation failed, retrying");
                    self.emit(ExchangeEvent::RelayRetry {
                        attempt,
                        max_retries,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err((stage, error)) => {
                    warn!(?stage, error = %error, "relay operation failed");
                    return ExchangeOutcome::Error {
                        kind: stage.kind(),
                        detail: error.to_string(),
                    };
                }
            }
        }
    }

    /// One subscribe → publish → wait cycle, bounded as a whole by the relay
    /// timeout. `Ok(None)` means the deadline passed.
    async fn relay_attempt(
        &self,
        relay: &Arc<dyn RelayTransport>,
        topic: &str,
        sealed: &str,
        validator: &MessageValidator,
    ) -> Result<Option<SignalEnvelope>, (RelayStage, TransportError)> {
        match tokio::time::timeout(
            self.config.relay_timeout,
            self.relay_cycle(relay, topic, sealed, validator),
        )
        .await
        {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn relay_cycle(
        &self,
        relay: &Arc<dyn RelayTransport>,
        topic: &str,
        sealed: &str,
        validator: &MessageValidator,
    ) -> Result<SignalEnvelope, (RelayStage, TransportError)> {
        let subscription = relay
            .subscribe(topic)
            .await
            .map_err(|e| (RelayStage::Subscribe, e))?;
        let _guard = SubscriptionGuard {
            relay: relay.clone(),
            id: subscription.id,
        };
        let mut events = subscription.events;

        // Subscribed and connected; only now is it safe to publish.
        relay
            .publish(topic, sealed)
            .await
            .map_err(|e| (RelayStage::Publish, e))?;
        self.emit(ExchangeEvent::RelayWaiting);

        self.first_response(&mut events, validator)
            .await
            .ok_or((RelayStage::Wait, TransportError::Disconnected))
    }

    async fn first_response(
        &self,
        events: &mut mpsc::UnboundedReceiver<RelayEvent>,
        validator: &MessageValidator,
    ) -> Option<SignalEnvelope> {
        while let Some(event) = events.recv().await {
            if !event.is_message() {
                trace!(event = %event.event, "ignoring relay event");
                continue;
            }
            if let Some(envelope) = self.accept_response(&event.payload, validator) {
                return Some(envelope);
            }
        }
        None
    }

    /// Open, validate and echo-check one payload; `None` drops it.
    fn accept_response(&self, payload: &str, validator: &MessageValidator) -> Option<SignalEnvelope> {
        let envelope = match self.codec.open(payload) {
            Ok(envelope) => envelope,
            Err(_) => {
                trace!("dropping payload that failed to open");
                return None;
            }
        };
        if let Err(e) = validator.validate(&envelope) {
            log_rejection(&e);
            return None;
        }
        if !envelope.is_response() {
            debug!("dropping echo of own request");
            return None;
        }
        Some(envelope)
    }

    fn emit(&self, event: ExchangeEvent) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }
}

fn log_rejection(e: &ValidationError) {
    match e {
        // Our own echo shows up as the request type.
        ValidationError::WrongMessageType { .. } => trace!(reason = e.code(), "dropping message"),
        _ => debug!(reason = e.code(), "dropping message"),
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Host Side
// ============================================================================

/// Host half of the signaling exchange: opens and validates incoming requests
/// and seals responses.
pub struct SignalingResponder {
    codec: SignalCodec,
    auth_key: DerivedKey,
    session_id: String,
    validator: MessageValidator,
    window_secs: i64,
}

impl SignalingResponder {
    pub fn new(keys: &SessionKeys, session_id: impl Into<String>, request_type: SignalType) -> Self {
        Self::with_config(keys, session_id, request_type, &PairingConfig::default())
    }

    pub fn with_config(
        keys: &SessionKeys,
        session_id: impl Into<String>,
        request_type: SignalType,
        config: &PairingConfig,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            codec: SignalCodec::new(&keys.signaling),
            auth_key: keys.auth.clone(),
            validator: MessageValidator::from_config(session_id.clone(), request_type, &config.validation),
            session_id,
            window_secs: config.validation.timestamp_window_secs,
        }
    }

    /// Open and validate a sealed request.
    ///
    /// `Ok(None)` for this host's own responses echoed back by the relay.
    pub fn open_request(&self, payload: &str) -> Result<Option<SignalEnvelope>, CoreError> {
        let envelope = self.codec.open(payload)?;
        if envelope.is_response() {
            return Ok(None);
        }
        self.validator.validate(&envelope)?;
        Ok(Some(envelope))
    }

    pub fn seal_response(&self, payload: SignalPayload) -> Result<String, CoreError> {
        let envelope = build_response(&self.session_id, payload)?;
        self.codec.seal(&envelope)
    }

    pub fn verify_direct(&self, request: &DirectRequest) -> bool {
        request.session_id == self.session_id
            && verify_direct_request(&self.auth_key, request, unix_now(), self.window_secs)
    }
}
