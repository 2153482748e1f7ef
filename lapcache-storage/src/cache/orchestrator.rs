//! Public entry point of the trace cache.

use std::sync::Arc;

use chrono::Utc;
use lapcache_core::{
    CacheConfig, CacheEntry, CacheUsage, CorruptionError, LapCacheError, LapCacheResult,
};
use tracing::{debug, info, warn};

use super::checksum;
use super::codec;
use super::dedup::{RequestDeduplicator, RequestSignature};
use super::eviction::{EvictionManager, ReconcileReport};
use super::fs_storage::PAYLOAD_EXTENSION;
use super::metadata::{HandleSet, MetadataStore};
use super::retry::fetch_with_retry;
use super::traits::{ByteStorage, KeyValueStore, RemoteFetcher};

/// Longest key prefix kept in a storage location.
const LOCATION_PREFIX_LEN: usize = 48;

/// Per-call options for [`CacheOrchestrator::get_trace_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Skip the cache lookup. A successful fetch is still written back.
    pub bypass_cache: bool,
}

impl GetOptions {
    pub fn bypass() -> Self {
        Self { bypass_cache: true }
    }
}

/// Result of the best-effort cache write.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheWriteOutcome {
    /// The payload was written and indexed.
    Stored(CacheEntry),
    /// The encoded payload exceeds `max_file_size`; nothing was written.
    SkippedTooLarge { size: u64, limit: u64 },
    /// Caching is turned off.
    Disabled,
}

/// Storage location for a cache key.
///
/// A readable prefix of the key plus a digest of the whole key, so distinct
/// keys never share a payload even when their prefixes collide.
pub fn storage_location_for(key: &str) -> String {
    let mut prefix: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(LOCATION_PREFIX_LEN)
        .collect();
    if prefix.is_empty() {
        prefix.push_str("trace");
    }
    format!(
        "{prefix}_{}.{PAYLOAD_EXTENSION}",
        checksum::digest(key.as_bytes())
    )
}

struct Inner<R, K, S>
where
    R: RemoteFetcher,
    K: KeyValueStore,
    S: ByteStorage,
{
    config: CacheConfig,
    fetcher: Arc<R>,
    metadata: MetadataStore<K>,
    storage: Arc<S>,
    eviction: EvictionManager<S>,
}

/// Read-through cache for lap traces.
///
/// Answers "give me the trace for this lap" from local storage when a
/// verified copy exists, and otherwise from the remote fetcher. Concurrent
/// misses for the same key share one remote fetch.
///
/// Only fetch failures reach the caller. Every cache-management failure
/// (unreadable metadata, corrupt payloads, failed writes) is logged and the
/// request falls back to the remote.
///
/// # Example
///
/// ```ignore
/// let storage = Arc::new(FsByteStorage::open(cache_dir).await?);
/// let kv = Arc::new(LmdbKeyValueStore::new(meta_dir, 16)?);
/// let cache = CacheOrchestrator::new(CacheConfig::default(), fetcher, kv, storage)?;
///
/// let table = cache.get_trace("session-12/lap-7").await?;
/// let usage = cache.stats().await?;
/// ```
pub struct CacheOrchestrator<R, K, S>
where
    R: RemoteFetcher,
    K: KeyValueStore,
    S: ByteStorage,
{
    inner: Arc<Inner<R, K, S>>,
    inflight: Arc<RequestDeduplicator<String>>,
}

impl<R, K, S> CacheOrchestrator<R, K, S>
where
    R: RemoteFetcher + 'static,
    K: KeyValueStore + 'static,
    S: ByteStorage + 'static,
{
    /// Create an orchestrator. Fails if `config` does not validate.
    pub fn new(
        config: CacheConfig,
        fetcher: Arc<R>,
        kv: Arc<K>,
        storage: Arc<S>,
    ) -> LapCacheResult<Self> {
        config.validate()?;
        let metadata = MetadataStore::new(kv, &config);
        let eviction = EvictionManager::new(Arc::clone(&storage), &config);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                metadata,
                storage,
                eviction,
            }),
            inflight: Arc::new(RequestDeduplicator::new()),
        })
    }

    /// Share an in-flight registry with other orchestrators.
    pub fn with_deduplicator(mut self, inflight: Arc<RequestDeduplicator<String>>) -> Self {
        self.inflight = inflight;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub fn metadata(&self) -> &MetadataStore<K> {
        &self.inner.metadata
    }

    /// Get the trace for `key`, from cache when possible.
    pub async fn get_trace(&self, key: &str) -> LapCacheResult<String> {
        self.get_trace_with(key, GetOptions::default()).await
    }

    /// Get the trace for `key` with explicit options.
    pub async fn get_trace_with(&self, key: &str, options: GetOptions) -> LapCacheResult<String> {
        if self.inner.config.enabled && !options.bypass_cache {
            match self.inner.read_cached(key).await {
                Ok(Some(table)) => {
                    debug!(key, "trace cache hit");
                    return Ok(table);
                }
                Ok(None) => debug!(key, "trace cache miss"),
                Err(e) => warn!(key, error = %e, "trace cache read failed, fetching remote"),
            }
        }

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        self.inflight
            .run(&RequestSignature::trace(key), move || async move {
                inner.fetch_and_store(&owned_key).await
            })
            .await
    }

    /// Encode and store `raw` under `key`.
    ///
    /// This is the best-effort write step of [`Self::get_trace`] as a plain
    /// `Result`. `get_trace` logs and discards its error.
    pub async fn try_cache(&self, key: &str, raw: &str) -> LapCacheResult<CacheWriteOutcome> {
        self.inner.try_cache(key, raw).await
    }

    /// Remove one entry. Returns whether an entry existed.
    pub async fn invalidate(&self, key: &str) -> LapCacheResult<bool> {
        self.inner.purge(key, None).await
    }

    /// Delete every payload the cache knows about and both metadata items.
    ///
    /// Returns the number of payloads deleted. Registered handles whose
    /// payload was already gone are not counted.
    pub async fn clear_all(&self) -> LapCacheResult<usize> {
        let inner = &self.inner;
        let txn = inner.metadata.lock().await;

        let mut handles: HandleSet = txn.load_handles().await?;
        handles.extend(inner.storage.list().await?);
        handles.extend(
            txn.load()
                .await?
                .into_values()
                .map(|entry| entry.storage_location),
        );

        let mut deleted = 0;
        for handle in &handles {
            match inner.storage.exists(handle).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(handle = %handle, error = %e, "could not check payload during clear")
                }
            }
            match inner.storage.delete(handle).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(handle = %handle, error = %e, "payload delete failed during clear"),
            }
        }
        txn.clear().await?;
        info!(deleted, "trace cache cleared");
        Ok(deleted)
    }

    /// Usage report over the current metadata.
    pub async fn stats(&self) -> LapCacheResult<CacheUsage> {
        let entries = self.inner.metadata.load().await?;
        Ok(CacheUsage::from_entries(
            &entries,
            self.inner.config.max_cache_size,
        ))
    }

    /// Repair metadata/payload drift and run maintenance eviction.
    pub async fn maintain(&self) -> LapCacheResult<ReconcileReport> {
        let txn = self.inner.metadata.lock().await;
        let report = self.inner.eviction.reconcile(&txn).await?;
        if !report.dropped_rows.is_empty() || !report.reclaimed_payloads.is_empty() {
            info!(
                dropped_rows = report.dropped_rows.len(),
                reclaimed_payloads = report.reclaimed_payloads.len(),
                "reconciled trace cache"
            );
        }
        Ok(report)
    }
}

impl<R, K, S> Clone for CacheOrchestrator<R, K, S>
where
    R: RemoteFetcher,
    K: KeyValueStore,
    S: ByteStorage,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<R, K, S> Inner<R, K, S>
where
    R: RemoteFetcher,
    K: KeyValueStore,
    S: ByteStorage,
{
    /// Look up a verified, decoded copy of `key`.
    ///
    /// Corrupt or missing payloads are purged and reported as a miss.
    async fn read_cached(&self, key: &str) -> LapCacheResult<Option<String>> {
        let Some(entry) = self.metadata.get(key).await? else {
            return Ok(None);
        };

        let bytes = match self.storage.read(&entry.storage_location).await {
            Ok(bytes) => bytes,
            Err(LapCacheError::Storage(e)) if e.is_not_found() => {
                warn!(key, location = %entry.storage_location, "cached payload missing, dropping entry");
                self.purge_logged(key, &entry).await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let table = match verify_and_decode(&entry, bytes) {
            Ok(table) => table,
            Err(e) => {
                warn!(key, error = %e, "cached trace is corrupt, dropping entry");
                self.purge_logged(key, &entry).await;
                return Ok(None);
            }
        };

        let now = Utc::now();
        let touched = self
            .metadata
            .update(|entries| {
                if let Some(current) = entries.get_mut(key) {
                    current.touch(now);
                }
            })
            .await;
        if let Err(e) = touched {
            warn!(key, error = %e, "failed to record trace access");
        }
        Ok(Some(table))
    }

    /// Fetch from the remote and write back. Cache write errors are logged only.
    async fn fetch_and_store(&self, key: &str) -> LapCacheResult<String> {
        let raw = fetch_with_retry(self.fetcher.as_ref(), key, &self.config.retry).await?;

        match self.try_cache(key, &raw).await {
            Ok(CacheWriteOutcome::Stored(entry)) => debug!(
                key,
                stored_size = entry.stored_size,
                original_size = entry.original_size,
                encoded = entry.encoded(),
                "trace cached"
            ),
            Ok(CacheWriteOutcome::SkippedTooLarge { size, limit }) => {
                info!(key, size, limit, "trace too large to cache")
            }
            Ok(CacheWriteOutcome::Disabled) => {}
            Err(e) => warn!(key, error = %e, "trace cache write failed"),
        }
        Ok(raw)
    }

    async fn try_cache(&self, key: &str, raw: &str) -> LapCacheResult<CacheWriteOutcome> {
        if !self.config.enabled {
            return Ok(CacheWriteOutcome::Disabled);
        }

        let encoded = codec::encode(raw);
        let size = encoded.payload.len() as u64;
        if size > self.config.max_file_size {
            return Ok(CacheWriteOutcome::SkippedTooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }

        let location = storage_location_for(key);
        let txn = self.metadata.lock().await;

        // A row being replaced must not count against the room we need.
        let mut entries = txn.load().await?;
        if let Some(previous) = entries.remove(key) {
            txn.save(&entries).await?;
            if previous.storage_location != location {
                self.storage.delete(&previous.storage_location).await?;
                txn.forget_handles(&[previous.storage_location.as_str()])
                    .await?;
            }
        }

        self.eviction
            .ensure_room(size, Some(location.as_str()), &txn)
            .await?;

        let bytes = encoded.payload.as_bytes();
        txn.register_handle(&location).await?;
        self.storage.write(&location, bytes).await?;

        let now = Utc::now();
        let original_size = raw.len() as u64;
        let entry = CacheEntry {
            key: key.to_string(),
            storage_location: location,
            stored_size: size,
            original_size,
            compression_ratio: if original_size == 0 {
                1.0
            } else {
                size as f64 / original_size as f64
            },
            checksum: checksum::digest(bytes),
            created_at: now,
            last_accessed_at: now,
            encoding: encoded.meta,
        };

        let mut entries = txn.load().await?;
        entries.insert(key.to_string(), entry.clone());
        txn.save(&entries).await?;
        Ok(CacheWriteOutcome::Stored(entry))
    }

    /// Remove the entry for `key` with its payload and handle.
    ///
    /// With `expected`, the row is only removed if it still has the same
    /// checksum, so a fresh write racing a corruption purge survives.
    async fn purge(&self, key: &str, expected: Option<&CacheEntry>) -> LapCacheResult<bool> {
        let txn = self.metadata.lock().await;
        let mut entries = txn.load().await?;

        let stale = match (entries.get(key), expected) {
            (None, _) => return Ok(false),
            (Some(current), Some(expected)) => current.checksum == expected.checksum,
            (Some(_), None) => true,
        };
        if !stale {
            return Ok(false);
        }

        let Some(entry) = entries.remove(key) else {
            return Ok(false);
        };
        txn.save(&entries).await?;
        self.storage.delete(&entry.storage_location).await?;
        txn.forget_handles(&[entry.storage_location.as_str()]).await?;
        debug!(key, "removed cached trace");
        Ok(true)
    }

    async fn purge_logged(&self, key: &str, entry: &CacheEntry) {
        if let Err(e) = self.purge(key, Some(entry)).await {
            warn!(key, error = %e, "failed to drop cache entry");
        }
    }
}

/// Check the stored bytes against the entry and undo the codec.
fn verify_and_decode(entry: &CacheEntry, bytes: Vec<u8>) -> Result<String, CorruptionError> {
    if !checksum::verify(&bytes, &entry.checksum) {
        return Err(CorruptionError::ChecksumMismatch {
            key: entry.key.clone(),
            expected: entry.checksum.clone(),
            actual: checksum::digest(&bytes),
        });
    }

    let payload = String::from_utf8(bytes).map_err(|_| CorruptionError::InvalidUtf8 {
        key: entry.key.clone(),
    })?;
    codec::decode(&payload, &entry.encoding).map_err(|source| CorruptionError::Undecodable {
        key: entry.key.clone(),
        source,
    })
}
