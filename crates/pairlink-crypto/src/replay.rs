//! Replay protection for signaling nonces.
//!
//! Signaling nonces are random rather than sequential, so instead of a sliding
//! counter window this keeps the most recent nonces in a bounded FIFO. A nonce is
//! rejected while it is still inside the window; once evicted it is accepted
//! again.

use std::collections::{HashSet, VecDeque};

/// Default number of nonces remembered.
pub const DEFAULT_NONCE_CACHE_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("nonce already seen")]
    Replayed,
}

/// Bounded first-in-first-out set of recently seen nonces.
///
/// Not thread-safe on its own; callers that share it wrap it in a mutex.
#[derive(Debug)]
pub struct NonceCache {
    order: VecDeque<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
    capacity: usize,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_CACHE_CAPACITY)
    }
}

impl NonceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Reject a nonce still in the window, otherwise remember it, evicting the
    /// oldest entry when full.
    pub fn check_and_insert(&mut self, nonce: &[u8]) -> Result<(), ReplayError> {
        if self.seen.contains(nonce) {
            return Err(ReplayError::Replayed);
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(nonce.to_vec());
        self.seen.insert(nonce.to_vec());
        Ok(())
    }

    pub fn contains(&self, nonce: &[u8]) -> bool {
        self.seen.contains(nonce)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(i: u32) -> [u8; 16] {
        let mut n = [0u8; 16];
        n[..4].copy_from_slice(&i.to_be_bytes());
        n
    }

    #[test]
    fn test_rejects_duplicate() {
        let mut cache = NonceCache::default();
        assert!(cache.check_and_insert(&nonce(42)).is_ok());
        assert_eq!(cache.check_and_insert(&nonce(42)), Err(ReplayError::Replayed));
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let mut cache = NonceCache::new(100);
        for i in 0..100 {
            assert!(cache.check_and_insert(&nonce(i)).is_ok());
        }
        assert_eq!(cache.len(), 100);
        assert!(cache.contains(&nonce(0)));

        // The 101st evicts the oldest.
        assert!(cache.check_and_insert(&nonce(100)).is_ok());
        assert_eq!(cache.len(), 100);
        assert!(!cache.contains(&nonce(0)));

        // The evicted nonce is valid again; the second oldest is still rejected.
        assert!(cache.check_and_insert(&nonce(0)).is_ok());
        assert_eq!(cache.check_and_insert(&nonce(2)), Err(ReplayError::Replayed));
    }

    #[test]
    fn test_clear() {
        let mut cache = NonceCache::default();
        cache.check_and_insert(&nonce(1)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.check_and_insert(&nonce(1)).is_ok());
    }
}
