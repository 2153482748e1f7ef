//! Collaborator traits consumed by the trace cache.
//!
//! The cache never talks to a network stack, a database, or the filesystem
//! directly. It goes through these three seams so that the durable pieces
//! can be swapped (LMDB, plain files, memory) and mocked in tests.

use async_trait::async_trait;
use lapcache_core::{FetchError, LapCacheResult};

/// Small durable string key-value store.
///
/// Holds the metadata map and the payload-handle list, each under one fixed
/// name. Values are whole documents; there is no partial update.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value stored under `name`, or None.
    async fn get_item(&self, name: &str) -> LapCacheResult<Option<String>>;

    /// Replace the value stored under `name`.
    async fn set_item(&self, name: &str, value: &str) -> LapCacheResult<()>;

    /// Remove `name`. Removing a missing name is not an error.
    async fn remove_item(&self, name: &str) -> LapCacheResult<()>;
}

/// Device byte storage addressed by opaque location handles.
#[async_trait]
pub trait ByteStorage: Send + Sync {
    /// Write `bytes` at `location`, replacing anything already there.
    async fn write(&self, location: &str, bytes: &[u8]) -> LapCacheResult<()>;

    /// Read the bytes at `location`.
    ///
    /// Returns `StorageError::NotFound` when nothing is stored there.
    async fn read(&self, location: &str) -> LapCacheResult<Vec<u8>>;

    /// Delete the bytes at `location`. Deleting a missing location is not an error.
    async fn delete(&self, location: &str) -> LapCacheResult<()>;

    /// Whether anything is stored at `location`.
    async fn exists(&self, location: &str) -> LapCacheResult<bool>;

    /// Every payload handle currently stored.
    async fn list(&self) -> LapCacheResult<Vec<String>>;
}

/// Source of raw trace tables, usually the remote telemetry service.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetch the raw delimited table for a lap.
    async fn fetch_raw_trace(&self, key: &str) -> Result<String, FetchError>;
}
