//! In-memory collaborators.
//!
//! Useful for tests and for platforms without durable storage. Contents are
//! lost when the value is dropped.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use lapcache_core::{LapCacheResult, StorageError};

use super::traits::{ByteStorage, KeyValueStore};

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    items: tokio::sync::RwLock<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get_item(&self, name: &str) -> LapCacheResult<Option<String>> {
        Ok(self.items.read().await.get(name).cloned())
    }

    async fn set_item(&self, name: &str, value: &str) -> LapCacheResult<()> {
        self.items
            .write()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, name: &str) -> LapCacheResult<()> {
        self.items.write().await.remove(name);
        Ok(())
    }
}

/// In-memory [`ByteStorage`]. Listing order is sorted by handle.
#[derive(Debug, Default)]
pub struct InMemoryByteStorage {
    blobs: tokio::sync::RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryByteStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held.
    pub async fn total_bytes(&self) -> u64 {
        self.blobs
            .read()
            .await
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }
}

#[async_trait]
impl ByteStorage for InMemoryByteStorage {
    async fn write(&self, location: &str, bytes: &[u8]) -> LapCacheResult<()> {
        self.blobs
            .write()
            .await
            .insert(location.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read(&self, location: &str) -> LapCacheResult<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound {
                    location: location.to_string(),
                }
                .into()
            })
    }

    async fn delete(&self, location: &str) -> LapCacheResult<()> {
        self.blobs.write().await.remove(location);
        Ok(())
    }

    async fn exists(&self, location: &str) -> LapCacheResult<bool> {
        Ok(self.blobs.read().await.contains_key(location))
    }

    async fn list(&self) -> LapCacheResult<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}
