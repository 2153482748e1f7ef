//! lapcache storage - the trace cache and its collaborators.
//!
//! Pure data types, errors and configuration live in `lapcache-core`.

pub mod cache;

pub use cache::{
    fetch_with_retry, storage_location_for, ByteStorage, CacheOrchestrator, CacheWriteOutcome,
    EvictionManager, EvictionReport, FsByteStorage, GetOptions, InMemoryByteStorage,
    InMemoryKeyValueStore, KeyValueStore, LmdbKeyValueStore, LmdbStoreError, MetadataStore,
    MetadataTxn, ReconcileReport, RemoteFetcher, RequestDeduplicator, RequestSignature,
};
