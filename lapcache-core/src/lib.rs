//! lapcache Core - Entity Types
//!
//! Pure data structures shared by the cache crates: the per-trace
//! [`CacheEntry`], the codec's [`EncodingMeta`], usage reports, errors and
//! configuration. This crate contains no storage or network behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod config;
pub mod error;

pub use config::{CacheConfig, RetryConfig};
pub use error::{
    CodecError, ConfigError, CorruptionError, FetchError, LapCacheError, LapCacheResult,
    StorageError,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Stable identifier of a traced lap.
pub type CacheKey = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Metadata for every cached trace, ordered by key.
pub type EntryMap = BTreeMap<CacheKey, CacheEntry>;

// ============================================================================
// CODEC METADATA
// ============================================================================

/// What the delta codec did to a payload, needed to reverse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingMeta {
    /// Whether delta encoding was applied. When false the payload is stored verbatim.
    pub encoded: bool,
    /// Byte length of the raw table.
    pub original_len: u64,
    /// Byte length of the payload as stored.
    pub encoded_len: u64,
    /// `encoded_len / original_len`.
    pub ratio: f64,
    /// Column positions that carry deltas, resolved from the header at encode time.
    pub delta_columns: Vec<usize>,
}

impl EncodingMeta {
    /// Metadata for a payload stored as-is.
    pub fn passthrough(len: usize) -> Self {
        Self {
            encoded: false,
            original_len: len as u64,
            encoded_len: len as u64,
            ratio: 1.0,
            delta_columns: Vec::new(),
        }
    }
}

// ============================================================================
// CACHE ENTRY
// ============================================================================

/// Metadata for one cached lap trace.
///
/// `checksum` is always computed over the bytes at `storage_location`, i.e.
/// over the encoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Opaque handle of the stored payload.
    pub storage_location: String,
    pub stored_size: u64,
    pub original_size: u64,
    pub compression_ratio: f64,
    pub checksum: String,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub encoding: EncodingMeta,
}

impl CacheEntry {
    /// Whether the codec was applied to the stored bytes.
    pub fn encoded(&self) -> bool {
        self.encoding.encoded
    }

    /// Record a successful read. Access time never moves backwards.
    pub fn touch(&mut self, now: Timestamp) {
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
    }
}

/// Sum of stored sizes over a metadata map.
pub fn total_stored_size(entries: &EntryMap) -> u64 {
    entries.values().map(|e| e.stored_size).sum()
}

// ============================================================================
// USAGE REPORTING
// ============================================================================

/// Per-entry line of a [`CacheUsage`] report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDetail {
    pub key: CacheKey,
    pub stored_size: u64,
    pub original_size: u64,
    pub compression_ratio: f64,
    pub encoded: bool,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
}

impl From<&CacheEntry> for EntryDetail {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            stored_size: entry.stored_size,
            original_size: entry.original_size,
            compression_ratio: entry.compression_ratio,
            encoded: entry.encoded(),
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
        }
    }
}

/// Snapshot of cache usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub file_count: usize,
    pub total_size: u64,
    pub original_total_size: u64,
    pub max_size: u64,
    /// `total_size / max_size * 100`.
    pub usage_percent: f64,
    /// `(1 - total_size / original_total_size) * 100`, zero when empty.
    pub compression_savings_percent: f64,
    /// Most recently used first.
    pub entries: Vec<EntryDetail>,
}

impl CacheUsage {
    /// Build a report from a metadata map.
    pub fn from_entries(entries: &EntryMap, max_size: u64) -> Self {
        let total_size = total_stored_size(entries);
        let original_total_size: u64 = entries.values().map(|e| e.original_size).sum();

        let usage_percent = if max_size == 0 {
            0.0
        } else {
            total_size as f64 / max_size as f64 * 100.0
        };
        let compression_savings_percent = if original_total_size == 0 {
            0.0
        } else {
            (1.0 - total_size as f64 / original_total_size as f64) * 100.0
        };

        let mut details: Vec<EntryDetail> = entries.values().map(EntryDetail::from).collect();
        details.sort_by(|a, b| {
            b.last_accessed_at
                .cmp(&a.last_accessed_at)
                .then_with(|| a.key.cmp(&b.key))
        });

        Self {
            file_count: entries.len(),
            total_size,
            original_total_size,
            max_size,
            usage_percent,
            compression_savings_percent,
            entries: details,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
