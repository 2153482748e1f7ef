//! Size-budget enforcement over the metadata store.
//!
//! Two budgets apply:
//!
//! - **Hard budget**: before an insert of `incoming` bytes, if
//!   `total + incoming > max_cache_size`, evict until
//!   `total <= max_cache_size - incoming`.
//! - **Maintenance**: whenever `total > max_cache_size * cleanup_threshold`,
//!   evict down to `max_cache_size * cleanup_target`.
//!
//! Victims are chosen least-recently-accessed first; ties go to key order.
//! Evicting an entry deletes its payload and its metadata row. When a
//! payload delete fails, the row is still dropped and the handle stays in
//! the registry, so the next [`EvictionManager::ensure_room`] reclaims the
//! bytes. Rows whose payload has disappeared never count toward the budget.

use std::collections::BTreeSet;
use std::sync::Arc;

use lapcache_core::{total_stored_size, CacheConfig, EntryMap, LapCacheResult};
use tracing::{debug, info, warn};

use super::metadata::{HandleSet, MetadataTxn};
use super::traits::{ByteStorage, KeyValueStore};

/// What an eviction pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Evicted keys, in eviction order.
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
    /// Payloads whose delete failed; left for reconciliation.
    pub failed_deletes: usize,
}

/// What a repair pass found, and the eviction that followed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Metadata rows dropped because their payload was gone.
    pub dropped_rows: Vec<String>,
    /// Payload handles deleted because no metadata row referenced them.
    pub reclaimed_payloads: Vec<String>,
    /// Eviction run after the repair.
    pub eviction: EvictionReport,
}

/// Enforces the global size budget with a least-recently-used policy.
pub struct EvictionManager<S: ByteStorage> {
    storage: Arc<S>,
    max_cache_size: u64,
    cleanup_threshold: u64,
    cleanup_target: u64,
}

impl<S: ByteStorage> EvictionManager<S> {
    /// Create a manager with budgets taken from `config`.
    pub fn new(storage: Arc<S>, config: &CacheConfig) -> Self {
        Self {
            storage,
            max_cache_size: config.max_cache_size,
            cleanup_threshold: config.cleanup_threshold_bytes(),
            cleanup_target: config.cleanup_target_bytes(),
        }
    }

    /// Keys to evict, in order, so that `incoming` more bytes fit.
    pub fn plan(&self, entries: &EntryMap, incoming: u64) -> Vec<String> {
        let total = total_stored_size(entries);

        let mut goal = u64::MAX;
        if total.saturating_add(incoming) > self.max_cache_size {
            goal = self.max_cache_size.saturating_sub(incoming);
        }
        if total > self.cleanup_threshold {
            goal = goal.min(self.cleanup_target);
        }
        if total <= goal {
            return Vec::new();
        }

        let mut by_recency: Vec<_> = entries.values().collect();
        by_recency.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut remaining = total;
        by_recency
            .into_iter()
            .take_while(|entry| {
                let over = remaining > goal;
                if over {
                    remaining -= entry.stored_size;
                }
                over
            })
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Make room for an insert of `incoming` bytes.
    ///
    /// Runs under the caller's metadata lock, so the budget holds once the
    /// caller's insert completes. Before planning, rows whose payload is gone
    /// are dropped and registered payloads that no row references are
    /// deleted. `reserved` names the location the caller is about to write;
    /// its handle is never reclaimed.
    pub async fn ensure_room<K: KeyValueStore>(
        &self,
        incoming: u64,
        reserved: Option<&str>,
        txn: &MetadataTxn<'_, K>,
    ) -> LapCacheResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut entries = txn.load().await?;

        report.dropped_rows = self.drop_missing_rows(&mut entries).await?;
        if !report.dropped_rows.is_empty() {
            txn.save(&entries).await?;
        }

        let mut candidates = txn.load_handles().await?;
        if let Some(reserved) = reserved {
            candidates.remove(reserved);
        }
        report.reclaimed_payloads = self.reclaim_orphans(&entries, candidates, txn).await?;

        let victims = self.plan(&entries, incoming);
        if !victims.is_empty() {
            report.eviction = self.evict(&mut entries, &victims, txn).await?;
            info!(
                evicted = report.eviction.evicted.len(),
                freed_bytes = report.eviction.freed_bytes,
                incoming,
                "evicted cached traces to stay under budget"
            );
        }
        Ok(report)
    }

    /// Remove the given keys (payload and metadata) and persist the map.
    pub async fn evict<K: KeyValueStore>(
        &self,
        entries: &mut EntryMap,
        keys: &[String],
        txn: &MetadataTxn<'_, K>,
    ) -> LapCacheResult<EvictionReport> {
        let mut report = EvictionReport::default();
        let mut deleted_handles = Vec::new();

        for key in keys {
            let Some(entry) = entries.remove(key) else {
                continue;
            };
            match self.storage.delete(&entry.storage_location).await {
                Ok(()) => deleted_handles.push(entry.storage_location.clone()),
                Err(e) => {
                    warn!(key = %key, error = %e, "payload delete failed during eviction");
                    report.failed_deletes += 1;
                }
            }
            debug!(key = %key, size = entry.stored_size, "evicted cached trace");
            report.freed_bytes += entry.stored_size;
            report.evicted.push(key.clone());
        }

        txn.save(entries).await?;
        txn.forget_handles(&deleted_handles).await?;
        Ok(report)
    }

    /// Repair metadata/payload drift, then run maintenance eviction.
    ///
    /// Same repair as [`Self::ensure_room`], but orphan candidates also
    /// include every payload the storage lists, and rows whose handle fell
    /// out of the registry are registered again.
    pub async fn reconcile<K: KeyValueStore>(
        &self,
        txn: &MetadataTxn<'_, K>,
    ) -> LapCacheResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut entries = txn.load().await?;

        report.dropped_rows = self.drop_missing_rows(&mut entries).await?;
        txn.save(&entries).await?;

        let mut candidates = txn.load_handles().await?;
        candidates.extend(self.storage.list().await?);
        report.reclaimed_payloads = self.reclaim_orphans(&entries, candidates, txn).await?;

        let mut registry = txn.load_handles().await?;
        registry.extend(entries.values().map(|e| e.storage_location.clone()));
        txn.save_handles(&registry).await?;

        let victims = self.plan(&entries, 0);
        if !victims.is_empty() {
            report.eviction = self.evict(&mut entries, &victims, txn).await?;
        }
        Ok(report)
    }

    /// Drop rows whose payload no longer exists. Returns their keys.
    async fn drop_missing_rows(&self, entries: &mut EntryMap) -> LapCacheResult<Vec<String>> {
        let mut missing = Vec::new();
        for (key, entry) in entries.iter() {
            if !self.storage.exists(&entry.storage_location).await? {
                missing.push(key.clone());
            }
        }
        for key in &missing {
            warn!(key = %key, "dropping metadata row with no payload");
            entries.remove(key);
        }
        Ok(missing)
    }

    /// Delete every candidate payload that no row in `entries` references.
    ///
    /// Returns the handles actually deleted. Deleted and already-missing
    /// handles leave the registry; a handle whose check or delete fails stays
    /// registered for the next pass.
    async fn reclaim_orphans<K: KeyValueStore>(
        &self,
        entries: &EntryMap,
        candidates: HandleSet,
        txn: &MetadataTxn<'_, K>,
    ) -> LapCacheResult<Vec<String>> {
        let referenced: BTreeSet<&str> = entries
            .values()
            .map(|e| e.storage_location.as_str())
            .collect();

        let mut reclaimed = Vec::new();
        let mut forgotten = Vec::new();
        for handle in candidates {
            if referenced.contains(handle.as_str()) {
                continue;
            }
            match self.storage.exists(&handle).await {
                Ok(true) => {}
                Ok(false) => {
                    forgotten.push(handle);
                    continue;
                }
                Err(e) => {
                    warn!(handle = %handle, error = %e, "could not check orphaned payload");
                    continue;
                }
            }
            match self.storage.delete(&handle).await {
                Ok(()) => {
                    debug!(handle = %handle, "reclaimed orphaned payload");
                    reclaimed.push(handle.clone());
                    forgotten.push(handle);
                }
                Err(e) => warn!(handle = %handle, error = %e, "orphaned payload delete failed"),
            }
        }

        txn.forget_handles(&forgotten).await?;
        Ok(reclaimed)
    }
}
