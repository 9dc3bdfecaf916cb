//! Pairing lifecycle state machine.
//!
//! One attempt at a time per lifecycle instance:
//!
//! ```text
//! Idle -> Scanning -> QrParsed -> {TryingDirect -> DirectSignaling}
//!      -> {RelaySubscribing -> RelayWaitingForAnswer} -> Connecting
//!      -> Authenticating -> Authenticated(device_id) | Failed(reason)
//! ```
//!
//! Each attempt runs as its own tokio task behind a [`PairingTask`] handle and
//! is tagged with a generation number. `start` and `reset` bump the
//! generation, signal cancellation and abort the previous task before cleaning
//! up after it; state writes and callbacks from a stale generation are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use pairlink_crypto::SharedSecret;
use pairlink_proto::v1::SignalPayload;
use pairlink_transport::{DirectSignalClient, PeerConnection, PeerConnector, RelayTransport};

use crate::config::PairingConfig;
use crate::errors::{CoreError, FailureReason};
use crate::handshake::{AuthHandshake, HandshakeOutcome, RemoteIdentity};
use crate::keys::SessionKeys;
use crate::ownership::{ConnectionAcceptor, HandoffTarget, LifecycleState, OwnedConnection};
use crate::progress::{PairingPhase, ProgressEvent, ProgressSink, StepTimer};
use crate::qr::PairingInvite;
use crate::signaling::{
    build_request, ExchangeConfig, ExchangeEvent, ExchangeOutcome, ExchangeRequest,
    SignalingExchanger,
};
use crate::store::{CredentialStore, PairedDevice};
use crate::validator::sanitize_device_name;

// ============================================================================
// States
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Scanning,
    QrParsed,
    TryingDirect,
    DirectSignaling,
    RelaySubscribing,
    RelayWaitingForAnswer,
    Connecting,
    Authenticating,
    Authenticated(String),
    Failed(FailureReason),
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Authenticated(_) | PairingState::Failed(_))
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// This device, as announced in signaling requests.
#[derive(Clone, Debug)]
pub struct LocalDevice {
    pub device_id: String,
    pub device_name: String,
}

/// Everything the lifecycle drives but does not implement.
#[derive(Clone)]
pub struct PairingDeps {
    pub connector: Arc<dyn PeerConnector>,
    pub direct: Option<Arc<dyn DirectSignalClient>>,
    pub relay: Option<Arc<dyn RelayTransport>>,
    pub acceptor: Arc<dyn ConnectionAcceptor>,
    pub store: Arc<dyn CredentialStore>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

// ============================================================================
// Session
// ============================================================================

/// Secret material and the connection held by one attempt.
struct PairingSession {
    secret: SharedSecret,
    keys: SessionKeys,
    /// Present while the pairing subsystem holds the connection
    connection: Option<Arc<OwnedConnection>>,
}

impl PairingSession {
    /// Close the connection if still ours and zero all key material.
    fn cleanup(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.cleanup() {
                debug!("closed connection during cleanup");
            }
        }
        self.keys.wipe();
        self.secret.wipe();
    }
}

struct ActiveAttempt {
    generation: u64,
    cancel: watch::Sender<bool>,
    abort: AbortHandle,
}

#[derive(Default)]
struct Shared {
    state: PairingState,
    session: Option<(u64, PairingSession)>,
    active: Option<ActiveAttempt>,
    /// Caller-safe text for the last failed attempt
    failure: Option<&'static str>,
}

impl Default for PairingState {
    fn default() -> Self {
        PairingState::Idle
    }
}

struct LifecycleInner {
    config: PairingConfig,
    local: LocalDevice,
    deps: PairingDeps,
    generation: AtomicU64,
    /// Serializes generation bumps with state publication so no callback from
    /// a superseded attempt runs after `start`/`reset` return. Reentrant so a
    /// sink may call `start` or `reset` from inside a callback.
    gate: ReentrantMutex<()>,
    shared: Mutex<Shared>,
}

// ============================================================================
// Task Handle
// ============================================================================

/// Handle to one running pairing attempt.
pub struct PairingTask {
    generation: u64,
    handle: JoinHandle<PairingState>,
    cancel: watch::Sender<bool>,
}

impl PairingTask {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ask the attempt to stop. It cleans up and ends in `Idle`.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the attempt's terminal state. An attempt that was superseded
    /// or aborted reports `Idle`.
    pub async fn wait(self) -> PairingState {
        match self.handle.await {
            Ok(state) => state,
            Err(e) => {
                debug!(generation = self.generation, cancelled = e.is_cancelled(), "pairing task ended early");
                PairingState::Idle
            }
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

enum AttemptError {
    Failed(FailureReason, CoreError),
    Cancelled,
}

impl AttemptError {
    fn failed(reason: FailureReason, error: impl Into<CoreError>) -> Self {
        AttemptError::Failed(reason, error.into())
    }
}

#[derive(Clone)]
pub struct PairingLifecycle {
    inner: Arc<LifecycleInner>,
}

impl PairingLifecycle {
    pub fn new(config: PairingConfig, local: LocalDevice, deps: PairingDeps) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                local,
                deps,
                generation: AtomicU64::new(0),
                gate: ReentrantMutex::new(()),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    pub fn state(&self) -> PairingState {
        self.inner.shared.lock().state.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Displayable reason for the current `Failed` state. Security-sensitive
    /// failures all read the same.
    pub fn failure_message(&self) -> Option<&'static str> {
        self.inner.shared.lock().failure
    }

    /// The camera is open and waiting for a code. Supersedes any attempt.
    pub fn begin_scanning(&self) {
        let generation = self.inner.supersede();
        self.inner.publish_state(generation, PairingState::Scanning);
    }

    /// Start pairing with a scanned QR payload, superseding any outstanding
    /// attempt. Must be called from within a tokio runtime.
    pub fn start(&self, qr_payload: &str) -> PairingTask {
        let generation = self.inner.supersede();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Hold the lock across spawn so the task cannot finish before it is
        // registered as active.
        let mut shared = self.inner.shared.lock();
        let inner = self.inner.clone();
        let qr = qr_payload.to_string();
        let handle = tokio::spawn(async move { inner.run_attempt(generation, qr, cancel_rx).await });
        shared.active = Some(ActiveAttempt {
            generation,
            cancel: cancel_tx.clone(),
            abort: handle.abort_handle(),
        });
        drop(shared);

        info!(generation, "pairing attempt started");
        PairingTask {
            generation,
            handle,
            cancel: cancel_tx,
        }
    }

    /// Start and wait for the terminal state.
    pub async fn pair(&self, qr_payload: &str) -> PairingState {
        self.start(qr_payload).wait().await
    }

    /// Abandon any attempt, release resources and return to `Idle`.
    /// Idempotent.
    pub fn reset(&self) {
        let generation = self.inner.supersede();
        self.inner.publish_state(generation, PairingState::Idle);
    }
}

impl LifecycleInner {
    /// Bump the generation, stop the active attempt and clean up after it.
    fn supersede(&self) -> u64 {
        let _gate = self.gate.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (active, session) = {
            let mut shared = self.shared.lock();
            shared.failure = None;
            (shared.active.take(), shared.session.take())
        };
        if let Some(active) = active {
            debug!(generation = active.generation, "superseding pairing attempt");
            active.cancel.send_replace(true);
            active.abort.abort();
        }
        if let Some((_, mut session)) = session {
            session.cleanup();
        }
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Record and announce a state, unless `generation` is stale.
    fn publish_state(&self, generation: u64, state: PairingState) -> bool {
        let _gate = self.gate.lock();
        if !self.is_current(generation) {
            return false;
        }
        self.shared.lock().state = state.clone();
        if let Some(sink) = &self.deps.progress {
            sink.on_state(&state);
        }
        true
    }

    fn record_failure(&self, generation: u64, message: &'static str) {
        let _gate = self.gate.lock();
        if self.is_current(generation) {
            self.shared.lock().failure = Some(message);
        }
    }

    fn publish_progress(&self, generation: u64, event: ProgressEvent) {
        let _gate = self.gate.lock();
        if !self.is_current(generation) {
            return;
        }
        if let Some(sink) = &self.deps.progress {
            sink.on_progress(&event);
        }
    }

    fn enter_phase(&self, generation: u64, timer: &Mutex<StepTimer>, phase: PairingPhase) {
        let result = timer.lock().enter(phase);
        match result {
            Ok(finished) => {
                if let Some((done, elapsed)) = finished {
                    self.publish_progress(generation, ProgressEvent::PhaseCompleted { phase: done, elapsed });
                }
                self.publish_progress(generation, ProgressEvent::PhaseStarted(phase));
            }
            Err(e) => debug!(error = %e, "phase out of order"),
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        qr: String,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> PairingState {
        let timer = Arc::new(Mutex::new(StepTimer::new()));

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => Err(AttemptError::Cancelled),
            r = self.drive(generation, &qr, &timer) => r,
        };

        let final_state = match result {
            Ok(device_id) => {
                if let Some((phase, elapsed)) = timer.lock().complete() {
                    self.publish_progress(generation, ProgressEvent::PhaseCompleted { phase, elapsed });
                }
                info!(%device_id, "pairing authenticated");
                PairingState::Authenticated(device_id)
            }
            Err(AttemptError::Failed(reason, error)) => {
                let public = error.public_message();
                warn!(%reason, public, error = %error, "pairing failed");
                self.record_failure(generation, public);
                if let Some((phase, elapsed)) = timer.lock().fail() {
                    self.publish_progress(generation, ProgressEvent::PhaseUnavailable { phase, elapsed });
                }
                PairingState::Failed(reason)
            }
            Err(AttemptError::Cancelled) => {
                info!(generation, "pairing attempt cancelled");
                PairingState::Idle
            }
        };

        self.finish_session(generation);
        self.publish_state(generation, final_state.clone());
        final_state
    }

    /// Clean up this generation's session, if it is still installed.
    fn finish_session(&self, generation: u64) {
        let session = {
            let mut shared = self.shared.lock();
            let ours = matches!(&shared.session, Some((g, _)) if *g == generation);
            if ours {
                shared.session.take()
            } else {
                None
            }
        };
        if let Some((_, mut session)) = session {
            session.cleanup();
        }
    }

    async fn drive(
        self: &Arc<Self>,
        generation: u64,
        qr: &str,
        timer: &Arc<Mutex<StepTimer>>,
    ) -> Result<String, AttemptError> {
        // Invite and keys
        let invite = PairingInvite::parse(qr).map_err(|e| AttemptError::failed(FailureReason::QrParseError, e))?;
        self.enter_phase(generation, timer, PairingPhase::Scanned);
        self.step(generation, PairingState::QrParsed)?;

        let keys = SessionKeys::derive(&invite.secret)
            .map_err(|e| AttemptError::failed(FailureReason::QrParseError, e))?;
        self.install_session(generation, &invite.secret, &keys)?;

        // Connection and offer
        self.enter_phase(generation, timer, PairingPhase::CreatingConnection);
        let peer = self
            .deps
            .connector
            .create()
            .await
            .map_err(|e| AttemptError::failed(FailureReason::ConnectionFailed, e))?;
        let owned = Arc::new(OwnedConnection::new(peer.clone()));
        self.attach_connection(generation, &owned)?;
        owned
            .transition(LifecycleState::Signaling)
            .map_err(|e| AttemptError::failed(FailureReason::ConnectionFailed, e))?;
        let offer = peer
            .create_offer()
            .await
            .map_err(|e| AttemptError::failed(FailureReason::ConnectionFailed, e))?;

        // Signaling
        self.enter_phase(generation, timer, PairingPhase::ReachingHost);
        let answer_sdp = self.exchange(generation, timer, &invite, &keys, offer).await?;

        // Transport connect
        self.step(generation, PairingState::Connecting)?;
        owned
            .transition(LifecycleState::Connecting)
            .map_err(|e| AttemptError::failed(FailureReason::ConnectionFailed, e))?;
        peer.set_remote_description(&answer_sdp)
            .await
            .map_err(|e| AttemptError::failed(FailureReason::ConnectionFailed, e))?;
        peer.wait_for_data_channel(self.config.timeouts.data_channel())
            .await
            .map_err(|e| AttemptError::failed(FailureReason::ConnectionFailed, e))?;

        // Handshake
        self.step(generation, PairingState::Authenticating)?;
        self.enter_phase(generation, timer, PairingPhase::Authenticating);
        owned
            .transition(LifecycleState::Authenticating)
            .map_err(|e| AttemptError::failed(FailureReason::ConnectionFailed, e))?;
        let identity = self.authenticate(&keys, peer.as_ref()).await?;

        // Handoff, then persistence
        let device = PairedDevice {
            device_id: identity.device_id.clone(),
            hostname: identity.hostname.clone(),
            device_type: identity.device_type.clone(),
            secret: invite.secret.clone(),
            direct_target: invite.direct_target.clone(),
            paired_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        self.hand_off(generation, &owned, &device).await?;

        if let Err(e) = self.deps.store.store_pairing(device).await {
            warn!(device_id = %identity.device_id, error = %e, "failed to persist pairing");
        }

        Ok(identity.device_id)
    }

    /// Publish a non-terminal state; a stale generation means we were
    /// superseded.
    fn step(&self, generation: u64, state: PairingState) -> Result<(), AttemptError> {
        if self.publish_state(generation, state) {
            Ok(())
        } else {
            Err(AttemptError::Cancelled)
        }
    }

    fn install_session(
        &self,
        generation: u64,
        secret: &SharedSecret,
        keys: &SessionKeys,
    ) -> Result<(), AttemptError> {
        let mut shared = self.shared.lock();
        if !self.is_current(generation) {
            return Err(AttemptError::Cancelled);
        }
        shared.session = Some((
            generation,
            PairingSession {
                secret: secret.clone(),
                keys: keys.clone(),
                connection: None,
            },
        ));
        Ok(())
    }

    fn attach_connection(&self, generation: u64, owned: &Arc<OwnedConnection>) -> Result<(), AttemptError> {
        let attached = {
            let mut shared = self.shared.lock();
            match &mut shared.session {
                Some((g, session)) if *g == generation => {
                    session.connection = Some(owned.clone());
                    true
                }
                _ => false,
            }
        };
        if attached {
            Ok(())
        } else {
            owned.cleanup();
            Err(AttemptError::Cancelled)
        }
    }

    async fn exchange(
        self: &Arc<Self>,
        generation: u64,
        timer: &Arc<Mutex<StepTimer>>,
        invite: &PairingInvite,
        keys: &SessionKeys,
        offer_sdp: String,
    ) -> Result<String, AttemptError> {
        let envelope = build_request(
            &invite.session_id,
            &self.local.device_id,
            &sanitize_device_name(&self.local.device_name),
            SignalPayload::Offer { sdp: offer_sdp },
        )
        .map_err(|e| AttemptError::failed(FailureReason::SignalingFailed, e))?;
        let request = ExchangeRequest {
            envelope,
            direct_target: invite.direct_target.clone(),
            relay_topic: invite.relay_topic(),
        };

        let mut exchanger = SignalingExchanger::new(keys, ExchangeConfig::from(&self.config));
        if let Some(direct) = &self.deps.direct {
            exchanger = exchanger.with_direct(direct.clone());
        }
        if let Some(relay) = &self.deps.relay {
            exchanger = exchanger.with_relay(relay.clone());
        }
        let inner = self.clone();
        let progress_timer = timer.clone();
        exchanger = exchanger.with_progress(Arc::new(move |event: ExchangeEvent| {
            inner.on_exchange_event(generation, &progress_timer, event);
        }));

        let has_relay = exchanger.has_relay();
        match exchanger.exchange(&request).await {
            ExchangeOutcome::Success { envelope, .. } => match envelope.sdp() {
                Some(sdp) => Ok(sdp.to_string()),
                None => Err(AttemptError::failed(
                    FailureReason::SignalingFailed,
                    CoreError::InvalidState("answer without session description".into()),
                )),
            },
            ExchangeOutcome::Timeout => {
                let reason = if has_relay {
                    FailureReason::RelayTimeout
                } else {
                    FailureReason::DirectTimeout
                };
                Err(AttemptError::failed(reason, CoreError::Timeout))
            }
            ExchangeOutcome::AuthFailed => Err(AttemptError::failed(FailureReason::AuthFailed, CoreError::Unauthorized)),
            ExchangeOutcome::Error { kind, detail } => {
                Err(AttemptError::failed(FailureReason::from(kind), CoreError::Signaling { kind, detail }))
            }
            ExchangeOutcome::Cancelled => Err(AttemptError::Cancelled),
        }
    }

    fn on_exchange_event(&self, generation: u64, timer: &Mutex<StepTimer>, event: ExchangeEvent) {
        match event {
            ExchangeEvent::DirectStarted => {
                self.enter_phase(generation, timer, PairingPhase::DirectAttempt);
                self.publish_state(generation, PairingState::TryingDirect);
            }
            ExchangeEvent::DirectRequestSent => {
                self.publish_state(generation, PairingState::DirectSignaling);
            }
            ExchangeEvent::DirectFailed => {}
            ExchangeEvent::RelaySubscribing { attempt } => {
                if attempt == 0 {
                    self.enter_phase(generation, timer, PairingPhase::RelayConnection);
                }
                self.publish_state(generation, PairingState::RelaySubscribing);
            }
            ExchangeEvent::RelayWaiting => {
                self.publish_state(generation, PairingState::RelayWaitingForAnswer);
            }
            ExchangeEvent::RelayRetry { attempt, max_retries, .. } => {
                self.publish_progress(generation, ProgressEvent::RelayRetry { attempt, max_retries });
            }
        }
    }

    async fn authenticate(
        &self,
        keys: &SessionKeys,
        channel: &dyn PeerConnection,
    ) -> Result<RemoteIdentity, AttemptError> {
        let handshake = AuthHandshake::new(keys.auth.clone()).with_timeout(self.config.timeouts.handshake());
        match handshake.run(channel).await {
            HandshakeOutcome::Success(identity) => Ok(identity),
            HandshakeOutcome::Failed(e) => Err(AttemptError::failed(FailureReason::AuthFailed, e)),
            HandshakeOutcome::Timeout => Err(AttemptError::failed(FailureReason::Timeout, CoreError::Timeout)),
        }
    }

    /// Tag the connection to its new owner, drop our reference, and only then
    /// call the acceptor.
    async fn hand_off(
        &self,
        generation: u64,
        owned: &Arc<OwnedConnection>,
        device: &PairedDevice,
    ) -> Result<(), AttemptError> {
        {
            let mut shared = self.shared.lock();
            if !self.is_current(generation) {
                return Err(AttemptError::Cancelled);
            }
            owned
                .mark_handed_off(HandoffTarget::ConnectionManager)
                .map_err(|_| AttemptError::Cancelled)?;
            if let Some((g, session)) = &mut shared.session {
                if *g == generation {
                    session.connection = None;
                }
            }
        }
        debug!(device_id = %device.device_id, "connection handed off");

        if let Err(e) = self.deps.acceptor.accept(owned.clone(), device).await {
            warn!(error = %e, "connection acceptor failed after handoff");
            return Err(AttemptError::Failed(FailureReason::ConnectionFailed, e));
        }
        Ok(())
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
