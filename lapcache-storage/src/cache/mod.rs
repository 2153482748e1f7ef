//! On-device cache for lap telemetry traces.
//!
//! A trace is a large delimited table that is slow to fetch. This module
//! keeps traces on local storage in delta-encoded form, verifies them on
//! every read, keeps total storage under a hard budget, and coalesces
//! concurrent fetches of the same trace.
//!
//! # Layers
//!
//! - [`checksum`]: xxh64 digest over stored bytes.
//! - [`codec`]: exact delta encoding of numeric telemetry channels.
//! - [`MetadataStore`]: the entry map and payload-handle registry, serialized
//!   behind a single-writer lock.
//! - [`EvictionManager`]: least-recently-used eviction and reconciliation.
//! - [`RequestDeduplicator`]: one in-flight fetch per signature.
//! - [`CacheOrchestrator`]: the read-through entry point composing the above.
//!
//! # Failure Model
//!
//! The cache is an optimization, never a dependency. Only remote fetch
//! failures reach callers of [`CacheOrchestrator::get_trace`]. Corruption,
//! missing payloads and failed writes are logged and fall back to the remote.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheOrchestrator::new(config, fetcher, kv, storage)?;
//! cache.maintain().await?;
//!
//! let table = cache.get_trace("session-12/lap-7").await?;
//! println!("{}% used", cache.stats().await?.usage_percent);
//! ```

pub mod checksum;
pub mod codec;
pub mod dedup;
pub mod eviction;
pub mod fs_storage;
pub mod lmdb_backend;
pub mod memory;
pub mod metadata;
pub mod orchestrator;
pub mod retry;
pub mod traits;

pub use codec::{Encoded, NUMERIC_COLUMNS};
pub use dedup::{RequestDeduplicator, RequestSignature};
pub use eviction::{EvictionManager, EvictionReport, ReconcileReport};
pub use fs_storage::{FsByteStorage, PAYLOAD_EXTENSION};
pub use lmdb_backend::{LmdbKeyValueStore, LmdbStoreError};
pub use memory::{InMemoryByteStorage, InMemoryKeyValueStore};
pub use metadata::{HandleSet, MetadataStore, MetadataTxn};
pub use orchestrator::{storage_location_for, CacheOrchestrator, CacheWriteOutcome, GetOptions};
pub use retry::fetch_with_retry;
pub use traits::{ByteStorage, KeyValueStore, RemoteFetcher};
