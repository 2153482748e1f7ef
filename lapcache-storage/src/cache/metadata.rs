//! Durable metadata for cached traces.
//!
//! The whole [`EntryMap`] lives as one JSON document under a fixed name in a
//! [`KeyValueStore`]; the list of payload handles lives under a second name.
//! Every mutation is a full-map read-modify-write.
//!
//! # Concurrency
//!
//! Tasks may interleave at every await point, so two unsynchronized
//! load-mutate-save cycles can clobber each other. Writers go through
//! [`MetadataStore::lock`] (or [`MetadataStore::update`]), which serializes
//! them behind one async mutex. Plain [`MetadataStore::load`] is lock-free
//! and may observe a map that is about to be replaced, which readers
//! tolerate: the payload bytes plus a matching checksum are the ground truth.

use std::collections::BTreeSet;
use std::sync::Arc;

use lapcache_core::{CacheConfig, CacheEntry, EntryMap, LapCacheResult, StorageError};
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::KeyValueStore;

/// Set of payload handles the cache believes it owns.
pub type HandleSet = BTreeSet<String>;

/// Metadata map and handle registry over a [`KeyValueStore`].
pub struct MetadataStore<K: KeyValueStore> {
    kv: Arc<K>,
    metadata_key: String,
    handles_key: String,
    writer: Mutex<()>,
}

impl<K: KeyValueStore> MetadataStore<K> {
    /// Create a store using the item names from `config`.
    pub fn new(kv: Arc<K>, config: &CacheConfig) -> Self {
        Self {
            kv,
            metadata_key: config.metadata_key.clone(),
            handles_key: config.handles_key.clone(),
            writer: Mutex::new(()),
        }
    }

    /// Get a reference to the underlying key-value store.
    pub fn backend(&self) -> &K {
        &self.kv
    }

    /// Load the full metadata map.
    ///
    /// A missing document is an empty map. An unreadable document is logged
    /// and also treated as empty; orphaned payloads are reclaimed later.
    pub async fn load(&self) -> LapCacheResult<EntryMap> {
        let Some(raw) = self.kv.get_item(&self.metadata_key).await? else {
            return Ok(EntryMap::new());
        };
        match serde_json::from_str::<EntryMap>(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(error = %e, "cache metadata unreadable, starting empty");
                Ok(EntryMap::new())
            }
        }
    }

    /// Replace the full metadata map.
    ///
    /// Does not take the writer lock; use [`MetadataStore::lock`] for
    /// read-modify-write sequences.
    pub async fn save(&self, entries: &EntryMap) -> LapCacheResult<()> {
        let raw = serde_json::to_string(entries).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        self.kv.set_item(&self.metadata_key, &raw).await
    }

    /// Load the metadata row for one key.
    pub async fn get(&self, key: &str) -> LapCacheResult<Option<CacheEntry>> {
        Ok(self.load().await?.remove(key))
    }

    /// Load the payload-handle registry.
    pub async fn load_handles(&self) -> LapCacheResult<HandleSet> {
        let Some(raw) = self.kv.get_item(&self.handles_key).await? else {
            return Ok(HandleSet::new());
        };
        match serde_json::from_str::<HandleSet>(&raw) {
            Ok(handles) => Ok(handles),
            Err(e) => {
                warn!(error = %e, "payload handle registry unreadable, starting empty");
                Ok(HandleSet::new())
            }
        }
    }

    /// Replace the payload-handle registry.
    pub async fn save_handles(&self, handles: &HandleSet) -> LapCacheResult<()> {
        let raw = serde_json::to_string(handles).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        self.kv.set_item(&self.handles_key, &raw).await
    }

    /// Acquire the writer lock for a multi-step read-modify-write sequence.
    pub async fn lock(&self) -> MetadataTxn<'_, K> {
        MetadataTxn {
            store: self,
            _guard: self.writer.lock().await,
        }
    }

    /// Load, mutate, and save the map under the writer lock.
    pub async fn update<F, R>(&self, f: F) -> LapCacheResult<R>
    where
        F: FnOnce(&mut EntryMap) -> R + Send,
    {
        let txn = self.lock().await;
        let mut entries = txn.load().await?;
        let result = f(&mut entries);
        txn.save(&entries).await?;
        Ok(result)
    }
}

/// Exclusive access to the metadata store. Dropping it releases the writer lock.
pub struct MetadataTxn<'a, K: KeyValueStore> {
    store: &'a MetadataStore<K>,
    _guard: MutexGuard<'a, ()>,
}

impl<K: KeyValueStore> MetadataTxn<'_, K> {
    pub async fn load(&self) -> LapCacheResult<EntryMap> {
        self.store.load().await
    }

    pub async fn save(&self, entries: &EntryMap) -> LapCacheResult<()> {
        self.store.save(entries).await
    }

    pub async fn load_handles(&self) -> LapCacheResult<HandleSet> {
        self.store.load_handles().await
    }

    pub async fn save_handles(&self, handles: &HandleSet) -> LapCacheResult<()> {
        self.store.save_handles(handles).await
    }

    /// Add one handle to the registry.
    pub async fn register_handle(&self, handle: &str) -> LapCacheResult<()> {
        let mut handles = self.load_handles().await?;
        if handles.insert(handle.to_string()) {
            self.save_handles(&handles).await?;
        }
        Ok(())
    }

    /// Remove handles from the registry.
    pub async fn forget_handles<H>(&self, removed: &[H]) -> LapCacheResult<()>
    where
        H: AsRef<str> + Sync,
    {
        let mut handles = self.load_handles().await?;
        let before = handles.len();
        for handle in removed {
            handles.remove(handle.as_ref());
        }
        if handles.len() != before {
            self.save_handles(&handles).await?;
        }
        Ok(())
    }

    /// Remove both the metadata map and the handle registry.
    pub async fn clear(&self) -> LapCacheResult<()> {
        self.store.kv.remove_item(&self.store.metadata_key).await?;
        self.store.kv.remove_item(&self.store.handles_key).await
    }
}
