//! Ownership of the live connection handle.
//!
//! A connection is created by the pairing subsystem and, once authenticated,
//! handed to the connection manager. Two independent axes are tracked under a
//! single lock:
//!
//! - `Owner`: who may close it. Exactly one owner at any time; `Disposed` once
//!   closed.
//! - `LifecycleState`: how far the pairing got with it.
//!
//! The lock also covers the close itself, so a transfer racing a close can
//! neither double-close nor close under the wrong owner.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use pairlink_transport::PeerConnection;

use crate::errors::{CoreError, OwnershipError};
use crate::store::PairedDevice;

// ============================================================================
// Owner / State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    PairingSubsystem,
    ConnectionManager,
    Disposed,
}

/// Subsystem a connection is handed to after authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandoffTarget {
    ConnectionManager,
}

impl HandoffTarget {
    pub fn owner(&self) -> Owner {
        match self {
            HandoffTarget::ConnectionManager => Owner::ConnectionManager,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Creating,
    Signaling,
    Connecting,
    Authenticating,
    HandedOff(HandoffTarget),
    Closed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::HandedOff(_) | LifecycleState::Closed)
    }

    /// Whether a cleanup by the pairing subsystem should close the connection.
    pub fn should_close_on_cleanup(&self) -> bool {
        !self.is_terminal()
    }

    /// Forward one step, `Authenticating -> HandedOff`, or any non-terminal
    /// state to `Closed`.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (HandedOff(_), _) | (Closed, _) => false,
            (_, Closed) => true,
            (Creating, Signaling) => true,
            (Signaling, Connecting) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, HandedOff(_)) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Creating => f.write_str("creating"),
            LifecycleState::Signaling => f.write_str("signaling"),
            LifecycleState::Connecting => f.write_str("connecting"),
            LifecycleState::Authenticating => f.write_str("authenticating"),
            LifecycleState::HandedOff(target) => write!(f, "handed_off({:?})", target),
            LifecycleState::Closed => f.write_str("closed"),
        }
    }
}

// ============================================================================
// Owned Connection
// ============================================================================

struct OwnershipInner {
    owner: Owner,
    state: LifecycleState,
    close_count: u32,
}

/// A peer connection tagged with its owner and lifecycle state.
pub struct OwnedConnection {
    connection: Arc<dyn PeerConnection>,
    inner: Mutex<OwnershipInner>,
}

impl OwnedConnection {
    /// Newly created connection, owned by the pairing subsystem.
    pub fn new(connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            connection,
            inner: Mutex::new(OwnershipInner {
                owner: Owner::PairingSubsystem,
                state: LifecycleState::Creating,
                close_count: 0,
            }),
        }
    }

    /// The underlying connection, for sending and receiving.
    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn owner(&self) -> Owner {
        self.inner.lock().owner
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Number of times the underlying connection was actually closed (0 or 1).
    pub fn close_count(&self) -> u32 {
        self.inner.lock().close_count
    }

    pub fn transition(&self, next: LifecycleState) -> Result<(), OwnershipError> {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(next) {
            return Err(OwnershipError::InvalidTransition {
                from: inner.state,
                to: next,
            });
        }
        inner.state = next;
        Ok(())
    }

    /// Atomically change the owner. Fails once disposed; `Disposed` itself is
    /// only reachable through `close_by_owner`.
    pub fn transfer_ownership(&self, new_owner: Owner) -> Result<(), OwnershipError> {
        if new_owner == Owner::Disposed {
            return Err(OwnershipError::DisposedTarget);
        }
        let mut inner = self.inner.lock();
        if inner.owner == Owner::Disposed {
            return Err(OwnershipError::Disposed);
        }
        debug!(from = ?inner.owner, to = ?new_owner, "connection ownership transferred");
        inner.owner = new_owner;
        Ok(())
    }

    /// Close the connection if `caller` owns it.
    ///
    /// Returns false, changing nothing, when the caller is not the current
    /// owner or the connection is already disposed.
    pub fn close_by_owner(&self, caller: Owner) -> bool {
        let mut inner = self.inner.lock();
        if caller == Owner::Disposed || inner.owner != caller {
            return false;
        }
        self.dispose_locked(&mut inner);
        true
    }

    /// Cleanup on behalf of the pairing subsystem: closes only while the
    /// pairing still owns the connection and has not finished with it.
    pub fn cleanup(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.owner != Owner::PairingSubsystem || !inner.state.should_close_on_cleanup() {
            return false;
        }
        self.dispose_locked(&mut inner);
        true
    }

    /// Record a successful handoff: state and owner change together.
    pub fn mark_handed_off(&self, target: HandoffTarget) -> Result<(), OwnershipError> {
        let mut inner = self.inner.lock();
        match inner.owner {
            Owner::Disposed => return Err(OwnershipError::Disposed),
            Owner::PairingSubsystem => {}
            Owner::ConnectionManager => return Err(OwnershipError::NotOwner),
        }
        let next = LifecycleState::HandedOff(target);
        if !inner.state.can_transition_to(next) {
            return Err(OwnershipError::InvalidTransition {
                from: inner.state,
                to: next,
            });
        }
        inner.state = next;
        inner.owner = target.owner();
        Ok(())
    }

    fn dispose_locked(&self, inner: &mut OwnershipInner) {
        inner.owner = Owner::Disposed;
        if !inner.state.is_terminal() {
            inner.state = LifecycleState::Closed;
        }
        if inner.close_count == 0 {
            inner.close_count = 1;
            self.connection.close();
            debug!("connection closed");
        } else {
            warn!("close requested on an already closed connection");
        }
    }
}

impl std::fmt::Debug for OwnedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OwnedConnection")
            .field("owner", &inner.owner)
            .field("state", &inner.state)
            .field("close_count", &inner.close_count)
            .finish()
    }
}

// ============================================================================
// Acceptor
// ============================================================================

/// Entry point of the subsystem that takes over an authenticated connection.
///
/// Called after the connection is already tagged to the new owner; an error
/// here does not return the connection to the pairing subsystem.
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    async fn accept(
        &self,
        connection: Arc<OwnedConnection>,
        device: &PairedDevice,
    ) -> Result<(), CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_transport::testing::MockPeerConnection;

    fn owned() -> (Arc<OwnedConnection>, Arc<MockPeerConnection>) {
        let (mock, _remote) = MockPeerConnection::pair();
        (Arc::new(OwnedConnection::new(mock.clone())), mock)
    }

    fn walk_to_authenticating(conn: &OwnedConnection) {
        conn.transition(LifecycleState::Signaling).unwrap();
        conn.transition(LifecycleState::Connecting).unwrap();
        conn.transition(LifecycleState::Authenticating).unwrap();
    }

    #[test]
    fn test_state_machine_transitions() {
        use LifecycleState::*;
        assert!(Creating.can_transition_to(Signaling));
        assert!(!Creating.can_transition_to(Connecting));
        assert!(Signaling.can_transition_to(Closed));
        assert!(Authenticating.can_transition_to(HandedOff(HandoffTarget::ConnectionManager)));
        assert!(!Connecting.can_transition_to(HandedOff(HandoffTarget::ConnectionManager)));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!HandedOff(HandoffTarget::ConnectionManager).can_transition_to(Closed));
    }

    #[test]
    fn test_should_close_on_cleanup() {
        use LifecycleState::*;
        for s in [Creating, Signaling, Connecting, Authenticating] {
            assert!(s.should_close_on_cleanup());
        }
        assert!(!Closed.should_close_on_cleanup());
        assert!(!HandedOff(HandoffTarget::ConnectionManager).should_close_on_cleanup());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (conn, _) = owned();
        let err = conn.transition(LifecycleState::Authenticating).unwrap_err();
        assert!(matches!(err, OwnershipError::InvalidTransition { .. }));
        assert_eq!(conn.state(), LifecycleState::Creating);
    }

    #[test]
    fn test_close_by_owner_closes_once() {
        let (conn, mock) = owned();
        assert!(conn.close_by_owner(Owner::PairingSubsystem));
        assert_eq!(conn.owner(), Owner::Disposed);
        assert_eq!(conn.state(), LifecycleState::Closed);
        assert!(!conn.close_by_owner(Owner::PairingSubsystem));
        assert!(!conn.close_by_owner(Owner::Disposed));
        assert_eq!(conn.close_count(), 1);
        assert_eq!(mock.close_calls(), 1);
    }

    #[test]
    fn test_non_owner_close_is_noop() {
        let (conn, mock) = owned();
        conn.transition(LifecycleState::Signaling).unwrap();
        assert!(!conn.close_by_owner(Owner::ConnectionManager));
        assert_eq!(conn.owner(), Owner::PairingSubsystem);
        assert_eq!(conn.state(), LifecycleState::Signaling);
        assert_eq!(conn.close_count(), 0);
        assert_eq!(mock.close_calls(), 0);
    }

    #[test]
    fn test_transfer_after_dispose_fails() {
        let (conn, _) = owned();
        assert!(conn.close_by_owner(Owner::PairingSubsystem));
        assert_eq!(
            conn.transfer_ownership(Owner::ConnectionManager),
            Err(OwnershipError::Disposed)
        );
        assert_eq!(conn.owner(), Owner::Disposed);
    }

    #[test]
    fn test_transfer_to_disposed_refused() {
        let (conn, mock) = owned();
        assert_eq!(
            conn.transfer_ownership(Owner::Disposed),
            Err(OwnershipError::DisposedTarget)
        );
        assert_eq!(conn.owner(), Owner::PairingSubsystem);
        assert_eq!(mock.close_calls(), 0);
    }

    #[test]
    fn test_cleanup_after_handoff_never_closes() {
        let (conn, mock) = owned();
        walk_to_authenticating(&conn);
        conn.mark_handed_off(HandoffTarget::ConnectionManager).unwrap();
        assert_eq!(conn.owner(), Owner::ConnectionManager);

        assert!(!conn.cleanup());
        assert!(!conn.close_by_owner(Owner::PairingSubsystem));
        assert_eq!(mock.close_calls(), 0);

        // The new owner can still close it.
        assert!(conn.close_by_owner(Owner::ConnectionManager));
        assert_eq!(mock.close_calls(), 1);
        assert_eq!(
            conn.state(),
            LifecycleState::HandedOff(HandoffTarget::ConnectionManager)
        );
    }

    #[test]
    fn test_cleanup_closes_while_pairing() {
        let (conn, mock) = owned();
        conn.transition(LifecycleState::Signaling).unwrap();
        assert!(conn.cleanup());
        assert!(!conn.cleanup());
        assert_eq!(mock.close_calls(), 1);
    }

    #[test]
    fn test_handoff_after_cleanup_fails() {
        let (conn, _) = owned();
        walk_to_authenticating(&conn);
        assert!(conn.cleanup());
        assert_eq!(
            conn.mark_handed_off(HandoffTarget::ConnectionManager),
            Err(OwnershipError::Disposed)
        );
    }

    #[test]
    fn test_transfer_close_race_closes_at_most_once() {
        for _ in 0..100 {
            let (conn, mock) = owned();
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let c1 = conn.clone();
            let b1 = barrier.clone();
            let transfer = std::thread::spawn(move || {
                b1.wait();
                c1.transfer_ownership(Owner::ConnectionManager)
            });

            let c2 = conn.clone();
            let b2 = barrier.clone();
            let close = std::thread::spawn(move || {
                b2.wait();
                c2.close_by_owner(Owner::PairingSubsystem)
            });

            let transferred = transfer.join().unwrap().is_ok();
            let closed = close.join().unwrap();

            assert!(mock.close_calls() <= 1);
            assert!(conn.close_count() <= 1);
            // Exactly one of the two wins.
            assert_ne!(transferred, closed);
            if closed {
                assert_eq!(conn.owner(), Owner::Disposed);
            } else {
                assert_eq!(conn.owner(), Owner::ConnectionManager);
                assert_eq!(mock.close_calls(), 0);
            }
        }
    }
}
