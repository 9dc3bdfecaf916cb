//! In-memory doubles for the transport collaborators.
//!
//! Used by the core's unit and integration tests and by the demo binary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::traits::{
    DirectRequest, DirectResponse, DirectSignalClient, DirectTarget, DuplexChannel, PeerConnection,
    PeerConnector, RelayEvent, RelaySubscription, RelayTransport, SubscriptionId,
};

/// Session description returned by `MockPeerConnection::create_offer`.
pub const MOCK_OFFER_SDP: &str =
    "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
/// A well-formed answer for the mock host to send back.
pub const MOCK_ANSWER_SDP: &str =
    "v=0\r\no=- 3 4 IN IP4 127.0.0.1\r\ns=-\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";

// ============================================================================
// Duplex channel
// ============================================================================

/// One end of an in-memory message pipe.
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl MemoryChannel {
    /// Two connected ends.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryChannel {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(a_rx),
            },
            MemoryChannel {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl DuplexChannel for MemoryChannel {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.tx.send(data).map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Disconnected)
    }
}

// ============================================================================
// Peer connection
// ============================================================================

/// Peer connection whose data channel is an in-memory pipe.
pub struct MockPeerConnection {
    channel: MemoryChannel,
    remote_description: Mutex<Option<String>>,
    data_channel_opens: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicU32,
}

impl MockPeerConnection {
    /// A connection plus the far end of its data channel (the host's side).
    pub fn pair() -> (Arc<MockPeerConnection>, MemoryChannel) {
        let (local, remote) = MemoryChannel::pair();
        let conn = Arc::new(MockPeerConnection {
            channel: local,
            remote_description: Mutex::new(None),
            data_channel_opens: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_calls: AtomicU32::new(0),
        });
        (conn, remote)
    }

    /// Make `wait_for_data_channel` fail.
    pub fn fail_data_channel(&self) {
        self.data_channel_opens.store(false, Ordering::SeqCst);
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_description.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` was invoked.
    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DuplexChannel for MockPeerConnection {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        self.channel.send(data).await
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        self.channel.recv().await
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<String, TransportError> {
        Ok(MOCK_OFFER_SDP.to_string())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError> {
        *self.remote_description.lock() = Some(sdp.to_string());
        Ok(())
    }

    async fn wait_for_data_channel(&self, _timeout: Duration) -> Result<(), TransportError> {
        if self.data_channel_opens.load(Ordering::SeqCst) && !self.is_closed() {
            Ok(())
        } else {
            Err(TransportError::Timeout)
        }
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out pre-built connections in order.
#[derive(Default)]
pub struct MockPeerConnector {
    queue: Mutex<VecDeque<Arc<MockPeerConnection>>>,
}

impl MockPeerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(conn: Arc<MockPeerConnection>) -> Self {
        let connector = Self::new();
        connector.push(conn);
        connector
    }

    pub fn push(&self, conn: Arc<MockPeerConnection>) {
        self.queue.lock().push_back(conn);
    }
}

#[async_trait]
impl PeerConnector for MockPeerConnector {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let conn = self
            .queue
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Other("no connection available".into()))?;
        Ok(conn)
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Computes the events a simulated remote peer publishes in reaction to a
/// publish on `topic`.
pub type RelayResponder = Arc<dyn Fn(&str, &str) -> Vec<RelayEvent> + Send + Sync>;

#[derive(Default)]
struct MockRelayState {
    next_id: u64,
    subscribers: HashMap<u64, (String, mpsc::UnboundedSender<RelayEvent>)>,
    published: Vec<(String, String)>,
    subscribe_failures: VecDeque<TransportError>,
    publish_failures: VecDeque<TransportError>,
    subscribe_calls: usize,
}

/// In-memory broker.
///
/// Every publish is delivered to the publishing topic's subscribers (so the
/// publisher hears its own echo, as on a real broker) and then to the optional
/// responder, whose returned events are delivered to the same topic.
#[derive(Default)]
pub struct MockRelay {
    state: Mutex<MockRelayState>,
    responder: Mutex<Option<RelayResponder>>,
    echo: AtomicBool,
}

impl MockRelay {
    pub fn new() -> Self {
        let relay = Self::default();
        relay.echo.store(true, Ordering::SeqCst);
        relay
    }

    /// Install the simulated remote peer.
    pub fn set_responder(&self, responder: RelayResponder) {
        *self.responder.lock() = Some(responder);
    }

    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// The next subscribe calls fail with these errors, in order.
    pub fn fail_next_subscribes(&self, errors: Vec<TransportError>) {
        self.state.lock().subscribe_failures.extend(errors);
    }

    pub fn fail_next_publishes(&self, errors: Vec<TransportError>) {
        self.state.lock().publish_failures.extend(errors);
    }

    /// Deliver an event to every subscriber of `topic`.
    pub fn inject(&self, topic: &str, event: RelayEvent) {
        let state = self.state.lock();
        for (sub_topic, tx) in state.subscribers.values() {
            if sub_topic == topic {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.state.lock().published.len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, TransportError> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if let Some(err) = state.subscribe_failures.pop_front() {
            return Err(err);
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(id, (topic.to_string(), tx));
        Ok(RelaySubscription {
            id: SubscriptionId(id),
            topic: topic.to_string(),
            events: rx,
        })
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if let Some(err) = state.publish_failures.pop_front() {
                return Err(err);
            }
            state.published.push((topic.to_string(), payload.to_string()));
        }

        if self.echo.load(Ordering::SeqCst) {
            self.inject(topic, RelayEvent::message(payload));
        }

        let responder = self.responder.lock().clone();
        if let Some(responder) = responder {
            for event in responder(topic, payload) {
                self.inject(topic, event);
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscribers.remove(&id.0);
    }
}

// ============================================================================
// Direct signaling
// ============================================================================

pub type DirectHandler =
    Arc<dyn Fn(&DirectTarget, &DirectRequest) -> Result<DirectResponse, TransportError> + Send + Sync>;

/// Scripted direct signaling endpoint.
pub struct MockDirectClient {
    handler: DirectHandler,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockDirectClient {
    pub fn with_handler(handler: DirectHandler) -> Self {
        Self {
            handler,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails with connection refused.
    pub fn refusing() -> Self {
        Self::with_handler(Arc::new(|_: &DirectTarget, _: &DirectRequest| {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        }))
    }

    /// Configure simulated latency
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectSignalClient for MockDirectClient {
    async fn post_signal(
        &self,
        target: &DirectTarget,
        request: &DirectRequest,
    ) -> Result<DirectResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(target, request)
    }
}
