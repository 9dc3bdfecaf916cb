//! Storage abstraction for completed pairings.
//!
//! Persistence itself is a collaborator; the pairing core only needs to hand
//! over the secret and connection hints, keyed by the device id the remote
//! side assigned during the handshake.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use pairlink_crypto::SharedSecret;
use pairlink_transport::DirectTarget;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

// ============================================================================
// Data Models
// ============================================================================

/// A device this one has completed pairing with.
#[derive(Clone, Debug)]
pub struct PairedDevice {
    /// Identifier assigned by the remote device (not ours)
    pub device_id: String,
    pub hostname: String,
    pub device_type: String,
    /// Needed to reconnect later without a new QR scan
    pub secret: SharedSecret,
    /// Last known direct address, if the invite carried one
    pub direct_target: Option<DirectTarget>,
    /// Unix timestamp of the pairing
    pub paired_at: u64,
}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert or replace the record for `device.device_id`.
    async fn store_pairing(&self, device: PairedDevice) -> Result<(), StoreError>;

    async fn load_pairing(&self, device_id: &str) -> Result<Option<PairedDevice>, StoreError>;

    /// Returns whether a record existed.
    async fn remove_pairing(&self, device_id: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory credential store for tests and the demo.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    records: RwLock<HashMap<String, PairedDevice>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn store_pairing(&self, device: PairedDevice) -> Result<(), StoreError> {
        if device.device_id.is_empty() {
            return Err(StoreError::OperationFailed("empty device id".into()));
        }
        self.records
            .write()
            .await
            .insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn load_pairing(&self, device_id: &str) -> Result<Option<PairedDevice>, StoreError> {
        Ok(self.records.read().await.get(device_id).cloned())
    }

    async fn remove_pairing(&self, device_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(device_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> PairedDevice {
        PairedDevice {
            device_id: id.into(),
            hostname: "desk".into(),
            device_type: "desktop".into(),
            secret: SharedSecret::new([4u8; 32]),
            direct_target: Some(DirectTarget {
                host: "192.168.1.20".into(),
                port: 8443,
            }),
            paired_at: 1_760_000_000,
        }
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let store = InMemoryCredentialStore::new();
        store.store_pairing(device("host-1")).await.unwrap();

        let loaded = store.load_pairing("host-1").await.unwrap().unwrap();
        assert_eq!(loaded.hostname, "desk");
        assert_eq!(loaded.secret.as_bytes(), &[4u8; 32]);
        assert!(store.load_pairing("host-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let store = InMemoryCredentialStore::new();
        store.store_pairing(device("host-1")).await.unwrap();
        let mut updated = device("host-1");
        updated.hostname = "laptop".into();
        store.store_pairing(updated).await.unwrap();
        assert_eq!(store.len().await, 1);

        assert!(store.remove_pairing("host-1").await.unwrap());
        assert!(!store.remove_pairing("host-1").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_rejects_empty_device_id() {
        let store = InMemoryCredentialStore::new();
        assert!(store.store_pairing(device("")).await.is_err());
    }
}
