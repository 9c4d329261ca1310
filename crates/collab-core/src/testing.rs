//! In-memory [`Storage`] for convergence/idempotence property tests and for
//! `collab-server`'s integration tests, where touching the filesystem would
//! add setup/teardown noise without exercising anything the trait contract
//! doesn't already cover. [`InProcessPubSub`] already serves as the in-memory
//! [`PubSub`](crate::pubsub::PubSub) half of this pair.

use crate::error::StoreError;
use crate::storage::Storage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// `Storage` backed by a `HashMap`, guarded by a `RwLock` since the trait's
/// methods are `&self`. Never persists anything past process exit.
#[derive(Default)]
pub struct InMemoryStorage {
    documents: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.documents.read().unwrap().get(name).cloned())
    }

    async fn store(&self, name: &str, update: &[u8]) -> Result<(), StoreError> {
        self.documents
            .write()
            .unwrap()
            .insert(name.to_string(), update.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_without_touching_disk() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.load("room-1").await.unwrap(), None);

        storage.store("room-1", b"hello").await.unwrap();
        assert_eq!(storage.load("room-1").await.unwrap(), Some(b"hello".to_vec()));

        storage.store("room-1", b"world").await.unwrap();
        assert_eq!(storage.load("room-1").await.unwrap(), Some(b"world".to_vec()));
    }
}
