//! Integration tests for the trace cache read path, write path and
//! maintenance operations.

use std::sync::Arc;
use std::time::Duration;

use lapcache_core::{CacheConfig, ConfigError, FetchError, LapCacheError};
use lapcache_storage::{
    storage_location_for, ByteStorage, CacheOrchestrator, CacheWriteOutcome, FsByteStorage,
    GetOptions, InMemoryByteStorage, InMemoryKeyValueStore, KeyValueStore, LmdbKeyValueStore,
};
use lapcache_test_utils::assertions::{
    assert_capacity_error, assert_fetch_error, assert_within_budget,
};
use lapcache_test_utils::fixtures::{self, lap_trace, memory_cache, small_config, SHORT_LAP};
use lapcache_test_utils::{init_test_tracing, FaultyByteStorage, MockRemoteFetcher};
use tempfile::TempDir;

/// A table with no delta channels, stored verbatim, exactly `len` bytes long.
fn blob(len: usize) -> String {
    assert!(len >= 8);
    format!("Driver\n{}\n", "x".repeat(len - 8))
}

async fn pause() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

// ============================================================================
// READ PATH
// ============================================================================

#[tokio::test]
async fn test_miss_then_hit() {
    init_test_tracing();
    let trace = lap_trace(200);
    let (cache, fetcher, _kv, _storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new().with_trace("lap-1", trace.clone()),
    )
    .unwrap();

    assert_eq!(cache.get_trace("lap-1").await.unwrap(), trace);
    assert_eq!(cache.get_trace("lap-1").await.unwrap(), trace);
    assert_eq!(fetcher.calls_for("lap-1"), 1);

    let usage = cache.stats().await.unwrap();
    assert_eq!(usage.file_count, 1);
    assert!(usage.entries[0].encoded);
    assert!(usage.total_size < usage.original_total_size);
    assert!(usage.compression_savings_percent > 0.0);
}

#[tokio::test]
async fn test_hit_updates_last_accessed() {
    let (cache, _fetcher, _kv, _storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP),
    )
    .unwrap();

    cache.get_trace("lap-1").await.unwrap();
    let before = cache.metadata().get("lap-1").await.unwrap().unwrap();
    pause().await;
    cache.get_trace("lap-1").await.unwrap();
    let after = cache.metadata().get("lap-1").await.unwrap().unwrap();

    assert!(after.last_accessed_at > before.last_accessed_at);
    assert_eq!(after.created_at, before.created_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_fetch_once() {
    let trace = lap_trace(500);
    let (cache, fetcher, _kv, _storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new()
            .with_trace("lap-1", trace.clone())
            .with_delay(Duration::from_millis(50)),
    )
    .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move { cache.get_trace("lap-1").await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), trace);
    }

    assert_eq!(fetcher.calls_for("lap-1"), 1);
    assert_eq!(cache.stats().await.unwrap().file_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failure_is_shared() {
    let fetcher = MockRemoteFetcher::new().with_delay(Duration::from_millis(20));
    fetcher.fail_always(Some(FetchError::from_status(507, "insufficient storage")));
    let (cache, fetcher, _kv, _storage) =
        memory_cache(small_config(1_000_000, 100_000), fetcher).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move { cache.get_trace("lap-1").await }));
    }
    for task in tasks {
        assert_capacity_error(&task.await.unwrap());
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_corrupt_payload_is_purged_and_refetched() {
    let (cache, fetcher, _kv, storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new().with_trace("lap-1", lap_trace(100)),
    )
    .unwrap();

    cache.get_trace("lap-1").await.unwrap();
    let corrupt = cache.metadata().get("lap-1").await.unwrap().unwrap();

    // Flip bytes on disk and change what the remote serves.
    let mut bytes = storage.read(&corrupt.storage_location).await.unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] = if bytes[mid] == b'7' { b'8' } else { b'7' };
    storage
        .write(&corrupt.storage_location, &bytes)
        .await
        .unwrap();
    let fresh = lap_trace(120);
    fetcher.set_trace("lap-1", fresh.clone());

    assert_eq!(cache.get_trace("lap-1").await.unwrap(), fresh);
    assert_eq!(fetcher.calls_for("lap-1"), 2);

    let rewritten = cache.metadata().get("lap-1").await.unwrap().unwrap();
    assert_ne!(rewritten.checksum, corrupt.checksum);
    assert_eq!(cache.get_trace("lap-1").await.unwrap(), fresh);
    assert_eq!(fetcher.calls_for("lap-1"), 2);
}

#[tokio::test]
async fn test_missing_payload_is_treated_as_miss() {
    let (cache, fetcher, _kv, storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP),
    )
    .unwrap();

    cache.get_trace("lap-1").await.unwrap();
    storage
        .delete(&storage_location_for("lap-1"))
        .await
        .unwrap();

    assert_eq!(cache.get_trace("lap-1").await.unwrap(), SHORT_LAP);
    assert_eq!(fetcher.calls_for("lap-1"), 2);
    assert!(storage.exists(&storage_location_for("lap-1")).await.unwrap());
}

#[tokio::test]
async fn test_bypass_skips_lookup_but_writes_back() {
    let (cache, fetcher, _kv, _storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP),
    )
    .unwrap();

    cache.get_trace("lap-1").await.unwrap();
    let updated = lap_trace(30);
    fetcher.set_trace("lap-1", updated.clone());

    let bypassed = cache
        .get_trace_with("lap-1", GetOptions::bypass())
        .await
        .unwrap();
    assert_eq!(bypassed, updated);
    assert_eq!(fetcher.calls_for("lap-1"), 2);

    assert_eq!(cache.get_trace("lap-1").await.unwrap(), updated);
    assert_eq!(fetcher.calls_for("lap-1"), 2);
    assert_eq!(cache.stats().await.unwrap().file_count, 1);
}

#[tokio::test]
async fn test_disabled_cache_always_fetches() {
    let (cache, fetcher, kv, storage) = memory_cache(
        small_config(1_000_000, 100_000).with_enabled(false),
        MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP),
    )
    .unwrap();

    cache.get_trace("lap-1").await.unwrap();
    cache.get_trace("lap-1").await.unwrap();

    assert_eq!(fetcher.calls_for("lap-1"), 2);
    assert!(kv.is_empty().await);
    assert_eq!(storage.total_bytes().await, 0);
    assert_eq!(
        cache.try_cache("lap-1", SHORT_LAP).await.unwrap(),
        CacheWriteOutcome::Disabled
    );
}

// ============================================================================
// FETCH FAILURES
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let fetcher = MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP);
    fetcher.fail_next(FetchError::Network {
        reason: "reset".into(),
    });
    fetcher.fail_next(FetchError::HttpStatus {
        status: 502,
        message: "bad gateway".into(),
    });
    let (cache, fetcher, _kv, _storage) =
        memory_cache(small_config(1_000_000, 100_000), fetcher).unwrap();

    assert_eq!(cache.get_trace("lap-1").await.unwrap(), SHORT_LAP);
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_surface_to_caller() {
    let fetcher = MockRemoteFetcher::new();
    fetcher.fail_always(Some(FetchError::Network {
        reason: "offline".into(),
    }));
    let (cache, fetcher, _kv, _storage) =
        memory_cache(small_config(1_000_000, 100_000), fetcher).unwrap();

    let result = cache.get_trace("lap-1").await;
    assert_fetch_error(&result);
    assert!(matches!(
        result,
        Err(LapCacheError::Fetch(FetchError::RetriesExhausted { attempts: 3, .. }))
    ));
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn test_capacity_failure_fails_fast() {
    let fetcher = MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP);
    fetcher.fail_next(FetchError::from_status(500, "Payload too large for worker"));
    let (cache, fetcher, _kv, _storage) =
        memory_cache(small_config(1_000_000, 100_000), fetcher).unwrap();

    assert_capacity_error(&cache.get_trace("lap-1").await);
    assert_eq!(fetcher.calls(), 1);

    // Nothing sticks: the next call starts fresh.
    assert_eq!(cache.get_trace("lap-1").await.unwrap(), SHORT_LAP);
}

#[tokio::test]
async fn test_empty_remote_payload_is_an_error() {
    let (cache, _fetcher, _kv, _storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new().with_trace("lap-1", ""),
    )
    .unwrap();

    assert!(matches!(
        cache.get_trace("lap-1").await,
        Err(LapCacheError::Fetch(FetchError::EmptyPayload { .. }))
    ));
    assert_eq!(cache.stats().await.unwrap().file_count, 0);
}

// ============================================================================
// WRITE PATH AND BUDGETS
// ============================================================================

#[tokio::test]
async fn test_oversized_trace_is_returned_but_not_cached() {
    let trace = blob(500);
    let (cache, _fetcher, _kv, storage) = memory_cache(
        small_config(1_000, 200),
        MockRemoteFetcher::new().with_trace("lap-1", trace.clone()),
    )
    .unwrap();

    assert_eq!(cache.get_trace("lap-1").await.unwrap(), trace);
    assert_eq!(cache.stats().await.unwrap().file_count, 0);
    assert_eq!(storage.total_bytes().await, 0);
    assert_eq!(
        cache.try_cache("lap-1", &trace).await.unwrap(),
        CacheWriteOutcome::SkippedTooLarge {
            size: 500,
            limit: 200
        }
    );
}

#[tokio::test]
async fn test_insert_evicts_least_recently_used() {
    let (cache, _fetcher, _kv, storage) =
        memory_cache(small_config(100, 60), MockRemoteFetcher::new()).unwrap();

    cache.try_cache("a", &blob(40)).await.unwrap();
    pause().await;
    cache.try_cache("b", &blob(30)).await.unwrap();
    pause().await;
    cache.try_cache("c", &blob(50)).await.unwrap();

    let usage = cache.stats().await.unwrap();
    let keys: Vec<&str> = usage.entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["c", "b"]);
    assert_eq!(usage.total_size, 80);
    assert!(!storage.exists(&storage_location_for("a")).await.unwrap());
}

#[tokio::test]
async fn test_entry_with_lost_payload_is_not_kept_over_live_one() {
    let (cache, _fetcher, _kv, storage) =
        memory_cache(small_config(100, 60), MockRemoteFetcher::new()).unwrap();

    cache.try_cache("live", &blob(30)).await.unwrap();
    pause().await;
    cache.try_cache("phantom", &blob(40)).await.unwrap();
    pause().await;
    storage.delete(&storage_location_for("phantom")).await.unwrap();

    cache.try_cache("c", &blob(60)).await.unwrap();

    let usage = cache.stats().await.unwrap();
    let keys: Vec<&str> = usage.entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["c", "live"]);
    assert_eq!(usage.total_size, 90);
    assert_eq!(storage.total_bytes().await, 90);
}

#[tokio::test]
async fn test_failed_eviction_deletes_are_reclaimed_by_later_inserts() {
    init_test_tracing();
    let inner = Arc::new(InMemoryByteStorage::new());
    let storage = Arc::new(FaultyByteStorage::new(Arc::clone(&inner)));
    let cache = CacheOrchestrator::new(
        small_config(100, 60),
        Arc::new(MockRemoteFetcher::new()),
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::clone(&storage),
    )
    .unwrap();

    storage.set_fail_deletes(true);
    for i in 0..6 {
        cache.try_cache(&format!("a{i}"), &blob(50)).await.unwrap();
        pause().await;
    }
    assert_eq!(cache.stats().await.unwrap().total_size, 100);
    assert_eq!(inner.total_bytes().await, 300);

    storage.set_fail_deletes(false);
    cache.try_cache("b", &blob(50)).await.unwrap();

    let usage = cache.stats().await.unwrap();
    assert_eq!(usage.total_size, 100);
    assert_eq!(inner.total_bytes().await, 100);

    let mut stored = inner.list().await.unwrap();
    stored.sort();
    let mut indexed: Vec<String> = usage
        .entries
        .iter()
        .map(|e| storage_location_for(&e.key))
        .collect();
    indexed.sort();
    assert_eq!(stored, indexed);
}

#[tokio::test]
async fn test_read_protects_entry_from_eviction() {
    let (cache, _fetcher, _kv, _storage) =
        memory_cache(small_config(100, 60), MockRemoteFetcher::new()).unwrap();

    cache.try_cache("a", &blob(40)).await.unwrap();
    pause().await;
    cache.try_cache("b", &blob(30)).await.unwrap();
    pause().await;
    cache.get_trace("a").await.unwrap();
    pause().await;
    cache.try_cache("c", &blob(50)).await.unwrap();

    let usage = cache.stats().await.unwrap();
    let keys: Vec<&str> = usage.entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["c", "a"]);
}

#[tokio::test]
async fn test_replacing_an_entry_does_not_double_count() {
    let (cache, _fetcher, _kv, _storage) =
        memory_cache(small_config(100, 60), MockRemoteFetcher::new()).unwrap();

    cache.try_cache("a", &blob(30)).await.unwrap();
    cache.try_cache("b", &blob(20)).await.unwrap();
    cache.try_cache("a", &blob(50)).await.unwrap();

    let usage = cache.stats().await.unwrap();
    assert_eq!(usage.file_count, 2);
    assert_eq!(usage.total_size, 70);
}

#[tokio::test]
async fn test_budget_holds_across_many_traces() {
    let config = small_config(20_000, 5_000);
    let fetcher = MockRemoteFetcher::new();
    for i in 0..40 {
        fetcher.set_trace(format!("lap-{i}"), lap_trace(20 + i * 7));
    }
    let (cache, _fetcher, _kv, _storage) = memory_cache(config.clone(), fetcher).unwrap();

    for i in 0..40 {
        cache.get_trace(&format!("lap-{i}")).await.unwrap();
        assert_within_budget(&cache.stats().await.unwrap(), &config);
    }
}

#[tokio::test]
async fn test_write_failure_never_fails_the_request() {
    let fetcher = Arc::new(MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP));
    let storage = Arc::new(FaultyByteStorage::new(Arc::new(InMemoryByteStorage::new())));
    storage.set_fail_writes(true);
    let cache = CacheOrchestrator::new(
        small_config(1_000_000, 100_000),
        Arc::clone(&fetcher),
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::clone(&storage),
    )
    .unwrap();

    assert_eq!(cache.get_trace("lap-1").await.unwrap(), SHORT_LAP);
    assert_eq!(cache.stats().await.unwrap().file_count, 0);
    assert!(cache.try_cache("lap-1", SHORT_LAP).await.is_err());

    storage.set_fail_writes(false);
    assert_eq!(cache.get_trace("lap-1").await.unwrap(), SHORT_LAP);
    assert_eq!(cache.stats().await.unwrap().file_count, 1);
}

// ============================================================================
// MAINTENANCE
// ============================================================================

#[tokio::test]
async fn test_invalidate_removes_entry() {
    let (cache, fetcher, _kv, storage) = memory_cache(
        small_config(1_000_000, 100_000),
        MockRemoteFetcher::new().with_trace("lap-1", SHORT_LAP),
    )
    .unwrap();

    cache.get_trace("lap-1").await.unwrap();
    assert!(cache.invalidate("lap-1").await.unwrap());
    assert!(!cache.invalidate("lap-1").await.unwrap());
    assert_eq!(storage.total_bytes().await, 0);

    cache.get_trace("lap-1").await.unwrap();
    assert_eq!(fetcher.calls_for("lap-1"), 2);
}

#[tokio::test]
async fn test_clear_all_removes_everything() {
    let (cache, _fetcher, kv, storage) =
        memory_cache(small_config(1_000_000, 100_000), MockRemoteFetcher::new()).unwrap();

    cache.try_cache("a", SHORT_LAP).await.unwrap();
    cache.try_cache("b", &lap_trace(10)).await.unwrap();
    storage.write("stray.trace", b"left behind").await.unwrap();
    cache
        .metadata()
        .lock()
        .await
        .register_handle("gone.trace")
        .await
        .unwrap();

    // The registered handle with no payload is not counted.
    assert_eq!(cache.clear_all().await.unwrap(), 3);
    assert!(storage.list().await.unwrap().is_empty());
    assert!(kv.is_empty().await);
    assert_eq!(cache.stats().await.unwrap().file_count, 0);
}

#[tokio::test]
async fn test_stats_report_usage() {
    let (cache, _fetcher, _kv, _storage) =
        memory_cache(small_config(1_000, 500), MockRemoteFetcher::new()).unwrap();

    cache.try_cache("a", &blob(100)).await.unwrap();
    pause().await;
    cache.try_cache("b", &blob(150)).await.unwrap();

    let usage = cache.stats().await.unwrap();
    assert_eq!(usage.file_count, 2);
    assert_eq!(usage.total_size, 250);
    assert_eq!(usage.original_total_size, 250);
    assert_eq!(usage.max_size, 1_000);
    assert!((usage.usage_percent - 25.0).abs() < 1e-9);
    assert_eq!(usage.compression_savings_percent, 0.0);
    assert_eq!(usage.entries[0].key, "b");
    assert!(!usage.entries[0].encoded);
}

#[tokio::test]
async fn test_maintain_reconciles_drift() {
    let (cache, _fetcher, kv, storage) =
        memory_cache(small_config(1_000_000, 100_000), MockRemoteFetcher::new()).unwrap();

    cache.try_cache("a", SHORT_LAP).await.unwrap();
    cache.try_cache("b", SHORT_LAP).await.unwrap();
    storage.delete(&storage_location_for("b")).await.unwrap();
    storage.write("orphan.trace", b"no metadata").await.unwrap();

    let report = cache.maintain().await.unwrap();
    assert_eq!(report.dropped_rows, vec!["b".to_string()]);
    assert_eq!(report.reclaimed_payloads, vec!["orphan.trace".to_string()]);

    let usage = cache.stats().await.unwrap();
    assert_eq!(usage.file_count, 1);
    assert_eq!(storage.list().await.unwrap(), vec![storage_location_for("a")]);

    let handles = kv
        .get_item(&cache.config().handles_key)
        .await
        .unwrap()
        .unwrap();
    assert!(handles.contains(&storage_location_for("a")));
    assert!(!handles.contains(&storage_location_for("b")));
}

#[tokio::test]
async fn test_maintain_shrinks_over_threshold() {
    let (cache, _fetcher, _kv, _storage) =
        memory_cache(small_config(100, 60), MockRemoteFetcher::new()).unwrap();

    // 45 + 40 = 85 fits the hard budget but sits above the 80% threshold.
    cache.try_cache("a", &blob(45)).await.unwrap();
    pause().await;
    cache.try_cache("b", &blob(40)).await.unwrap();
    assert_eq!(cache.stats().await.unwrap().total_size, 85);

    let report = cache.maintain().await.unwrap();
    assert_eq!(report.eviction.evicted, vec!["a".to_string()]);
    assert_eq!(cache.stats().await.unwrap().total_size, 40);
}

// ============================================================================
// CONSTRUCTION AND DURABLE BACKENDS
// ============================================================================

#[test]
fn test_invalid_config_is_rejected() {
    let config = CacheConfig::new()
        .with_max_cache_size(100)
        .with_max_file_size(200);
    let result = CacheOrchestrator::new(
        config,
        Arc::new(MockRemoteFetcher::new()),
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::new(InMemoryByteStorage::new()),
    );
    assert!(matches!(
        result,
        Err(LapCacheError::Config(ConfigError::InvalidValue { .. }))
    ));
}

#[tokio::test]
async fn test_durable_backends_survive_restart() {
    let payload_dir = TempDir::new().unwrap();
    let meta_dir = TempDir::new().unwrap();
    let trace = lap_trace(150);
    let fetcher = Arc::new(MockRemoteFetcher::new().with_trace("lap-9", trace.clone()));

    {
        let cache = CacheOrchestrator::new(
            fixtures::small_config(1_000_000, 100_000),
            Arc::clone(&fetcher),
            Arc::new(LmdbKeyValueStore::new(meta_dir.path(), 10).unwrap()),
            Arc::new(FsByteStorage::open(payload_dir.path()).await.unwrap()),
        )
        .unwrap();
        assert_eq!(cache.get_trace("lap-9").await.unwrap(), trace);
    }

    let cache = CacheOrchestrator::new(
        fixtures::small_config(1_000_000, 100_000),
        Arc::clone(&fetcher),
        Arc::new(LmdbKeyValueStore::new(meta_dir.path(), 10).unwrap()),
        Arc::new(FsByteStorage::open(payload_dir.path()).await.unwrap()),
    )
    .unwrap();
    assert_eq!(cache.get_trace("lap-9").await.unwrap(), trace);
    assert_eq!(fetcher.calls_for("lap-9"), 1);

    let report = cache.maintain().await.unwrap();
    assert!(report.dropped_rows.is_empty());
    assert!(report.reclaimed_payloads.is_empty());
}
