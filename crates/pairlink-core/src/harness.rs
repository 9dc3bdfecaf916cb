//! In-process host simulation for pairing tests and demos.
//!
//! [`HostSimulator`] plays the host side of every protocol step: it answers
//! sealed offers over the relay or the direct endpoint and runs the responder
//! half of the handshake. [`Loopback`] wires a [`PairingLifecycle`] to it
//! through the doubles in `pairlink_transport::testing`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use pairlink_crypto::{CryptoError, SharedSecret};
use pairlink_proto::v1::{DirectErrorV1, SignalPayload, SignalType};
use pairlink_transport::testing::{
    DirectHandler, MemoryChannel, MockDirectClient, MockPeerConnection, MockPeerConnector, MockRelay,
    RelayResponder, MOCK_ANSWER_SDP,
};
use pairlink_transport::{
    DirectRequest, DirectResponse, DirectSignalClient, DirectTarget, RelayEvent, RelayTransport,
};

use crate::config::PairingConfig;
use crate::errors::{CoreError, AUTH_FAILED_MESSAGE};
use crate::handshake::{AuthResponder, RemoteIdentity, ResponderOutcome};
use crate::keys::SessionKeys;
use crate::lifecycle::{LocalDevice, PairingDeps, PairingLifecycle, PairingState};
use crate::ownership::{ConnectionAcceptor, OwnedConnection};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::qr::PairingInvite;
use crate::signaling::SignalingResponder;
use crate::store::{InMemoryCredentialStore, PairedDevice};

// ============================================================================
// Host
// ============================================================================

/// The host end of one pairing session.
pub struct HostSimulator {
    keys: SessionKeys,
    session_id: String,
    identity: RemoteIdentity,
    config: PairingConfig,
}

impl HostSimulator {
    pub fn new(
        secret: &SharedSecret,
        session_id: impl Into<String>,
        identity: RemoteIdentity,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            keys: SessionKeys::derive(secret)?,
            session_id: session_id.into(),
            identity,
            config: PairingConfig::default(),
        })
    }

    pub fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    fn responder(&self) -> Arc<SignalingResponder> {
        Arc::new(SignalingResponder::with_config(
            &self.keys,
            self.session_id.clone(),
            SignalType::Offer,
            &self.config,
        ))
    }

    fn answer_for(responder: &SignalingResponder, payload: &str) -> Option<String> {
        match responder.open_request(payload) {
            Ok(Some(_offer)) => responder
                .seal_response(SignalPayload::Answer {
                    sdp: MOCK_ANSWER_SDP.to_string(),
                })
                .ok(),
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "host dropped signaling payload");
                None
            }
        }
    }

    /// Relay responder that answers offers published on `topic`.
    pub fn relay_responder(&self, topic: impl Into<String>) -> RelayResponder {
        let topic = topic.into();
        let responder = self.responder();
        Arc::new(move |published_on: &str, payload: &str| {
            if published_on != topic {
                return Vec::new();
            }
            Self::answer_for(&responder, payload)
                .map(|answer| vec![RelayEvent::message(answer)])
                .unwrap_or_default()
        })
    }

    /// Direct endpoint: 401 on a bad signature, 200 with a sealed answer
    /// otherwise.
    pub fn direct_handler(&self) -> DirectHandler {
        let responder = self.responder();
        Arc::new(move |_target: &DirectTarget, request: &DirectRequest| {
            if !responder.verify_direct(request) {
                return Ok(error_response(401, AUTH_FAILED_MESSAGE, "AUTH_FAILED"));
            }
            match Self::answer_for(&responder, &request.body) {
                Some(body) => Ok(DirectResponse { status: 200, body }),
                None => Ok(error_response(400, "invalid offer", "BAD_REQUEST")),
            }
        })
    }

    /// Run the responder half of the handshake on `channel`.
    pub fn spawn_auth(&self, channel: MemoryChannel) -> JoinHandle<ResponderOutcome> {
        let responder = AuthResponder::new(self.keys.auth.clone(), self.identity.clone())
            .with_timeout(self.config.timeouts.handshake());
        tokio::spawn(async move { responder.run(&channel).await })
    }
}

fn error_response(status: u16, error: &str, code: &str) -> DirectResponse {
    let body = DirectErrorV1 {
        error: error.to_string(),
        code: code.to_string(),
    };
    DirectResponse {
        status,
        body: serde_json::to_string(&body).unwrap_or_default(),
    }
}

// ============================================================================
// Recording Collaborators
// ============================================================================

/// Progress sink that keeps everything it is told.
#[derive(Default)]
pub struct RecordingProgressSink {
    states: Mutex<Vec<PairingState>>,
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<PairingState> {
        self.states.lock().clone()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_state(&self, state: &PairingState) {
        self.states.lock().push(state.clone());
    }

    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Acceptor that records handed-off connections, optionally failing.
#[derive(Default)]
pub struct RecordingAcceptor {
    accepted: Mutex<Vec<(String, Arc<OwnedConnection>)>>,
    fail: bool,
}

impl RecordingAcceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            accepted: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn accepted(&self) -> Vec<(String, Arc<OwnedConnection>)> {
        self.accepted.lock().clone()
    }
}

#[async_trait]
impl ConnectionAcceptor for RecordingAcceptor {
    async fn accept(&self, connection: Arc<OwnedConnection>, device: &PairedDevice) -> Result<(), CoreError> {
        self.accepted.lock().push((device.device_id.clone(), connection));
        if self.fail {
            return Err(CoreError::InvalidState("connection manager unavailable".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Loopback
// ============================================================================

/// Which signaling paths the simulated host offers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopbackMode {
    /// Host reachable on the direct endpoint.
    Direct,
    /// Direct target advertised but refusing connections; relay answers.
    DirectRefused,
    /// No direct target in the invite.
    RelayOnly,
    /// Direct refused and nobody answers on the relay.
    Silent,
}

/// A lifecycle paired against a simulated host.
pub struct Loopback {
    pub lifecycle: PairingLifecycle,
    pub invite: PairingInvite,
    pub host: HostSimulator,
    pub relay: Arc<MockRelay>,
    pub direct: Arc<MockDirectClient>,
    pub peer: Arc<MockPeerConnection>,
    pub connector: Arc<MockPeerConnector>,
    pub store: Arc<InMemoryCredentialStore>,
    pub acceptor: Arc<RecordingAcceptor>,
    pub progress: Arc<RecordingProgressSink>,
    host_channel: Mutex<Option<MemoryChannel>>,
}

impl Loopback {
    pub fn new(config: PairingConfig, mode: LoopbackMode) -> Result<Self, CoreError> {
        Self::with_acceptor(config, mode, Arc::new(RecordingAcceptor::new()))
    }

    pub fn with_acceptor(
        config: PairingConfig,
        mode: LoopbackMode,
        acceptor: Arc<RecordingAcceptor>,
    ) -> Result<Self, CoreError> {
        let secret = SharedSecret::generate()?;
        let session_id = hex::encode(pairlink_crypto::utils::random_bytes::<8>()?);
        let identity = RemoteIdentity {
            device_id: format!("host-{}", &session_id[..6]),
            hostname: "workstation".to_string(),
            device_type: "desktop".to_string(),
        };

        let mut invite = PairingInvite::new(session_id.clone(), secret.clone()).with_host_name(&identity.hostname);
        if mode != LoopbackMode::RelayOnly {
            invite = invite.with_direct_target("192.168.1.20", 8443);
        }
        let host = HostSimulator::new(&secret, session_id, identity)?;

        let relay = Arc::new(MockRelay::new());
        if mode != LoopbackMode::Silent {
            relay.set_responder(host.relay_responder(invite.relay_topic()));
        }
        let direct = Arc::new(match mode {
            LoopbackMode::Direct => MockDirectClient::with_handler(host.direct_handler()),
            _ => MockDirectClient::refusing(),
        });

        let (peer, host_channel) = MockPeerConnection::pair();
        let connector = Arc::new(MockPeerConnector::with_connection(peer.clone()));
        let store = Arc::new(InMemoryCredentialStore::new());
        let progress = Arc::new(RecordingProgressSink::new());
        let deps = PairingDeps {
            connector: connector.clone(),
            direct: Some(direct.clone() as Arc<dyn DirectSignalClient>),
            relay: Some(relay.clone() as Arc<dyn RelayTransport>),
            acceptor: acceptor.clone(),
            store: store.clone(),
            progress: Some(progress.clone() as Arc<dyn ProgressSink>),
        };
        let local = LocalDevice {
            device_id: "phone-1".to_string(),
            device_name: "Test Phone".to_string(),
        };

        Ok(Self {
            lifecycle: PairingLifecycle::new(config, local, deps),
            invite,
            host,
            relay,
            direct,
            peer,
            connector,
            store,
            acceptor,
            progress,
            host_channel: Mutex::new(Some(host_channel)),
        })
    }

    /// The host's end of the first connection's data channel, once.
    pub fn take_host_channel(&self) -> Option<MemoryChannel> {
        self.host_channel.lock().take()
    }

    /// Start the host's handshake task. Only the first call gets a handle.
    pub fn spawn_host_auth(&self) -> Option<JoinHandle<ResponderOutcome>> {
        let channel = self.take_host_channel()?;
        Some(self.host.spawn_auth(channel))
    }

    /// Run one full pairing attempt against the host.
    pub async fn run(&self) -> PairingState {
        let host = self.spawn_host_auth();
        let state = self.lifecycle.pair(&self.invite.to_uri()).await;
        if let Some(host) = host {
            if !matches!(state, PairingState::Authenticated(_)) {
                host.abort();
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_direct() {
        let lb = Loopback::new(PairingConfig::default(), LoopbackMode::Direct).unwrap();
        let state = lb.run().await;
        assert_eq!(state, PairingState::Authenticated(lb.host.identity().device_id.clone()));
        assert_eq!(lb.direct.calls(), 1);
        assert_eq!(lb.relay.publish_count(), 0);
    }

    #[test]
    fn test_direct_handler_rejects_bad_signature() {
        let secret = SharedSecret::new([4; 32]);
        let identity = RemoteIdentity {
            device_id: "h".into(),
            hostname: "h".into(),
            device_type: "desktop".into(),
        };
        let host = HostSimulator::new(&secret, "s1", identity).unwrap();
        let handler = host.direct_handler();
        let request = DirectRequest {
            session_id: "s1".into(),
            body: "AAAA".into(),
            signature: "00".repeat(32),
            timestamp: crate::validator::unix_now(),
        };
        let target = DirectTarget {
            host: "127.0.0.1".into(),
            port: 1,
        };
        let response = handler(&target, &request).unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(DirectErrorV1::parse_or_unknown(response.body.as_bytes()).code, "AUTH_FAILED");
    }
}
