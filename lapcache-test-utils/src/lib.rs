//! lapcache Test Utilities
//!
//! Shared test infrastructure for the lapcache workspace:
//! - Scripted remote fetcher and fault-injecting storage
//! - Proptest generators for delimited telemetry tables
//! - Fixtures for common cache scenarios
//! - Assertions over lapcache errors

pub use lapcache_core::{
    CacheConfig, CacheEntry, CacheUsage, EntryMap, FetchError, LapCacheError, LapCacheResult,
    RetryConfig, StorageError,
};
pub use lapcache_storage::{
    ByteStorage, CacheOrchestrator, InMemoryByteStorage, InMemoryKeyValueStore, KeyValueStore,
    RemoteFetcher,
};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

/// Remote fetcher backed by a map of canned traces.
///
/// Failures queued with [`MockRemoteFetcher::fail_next`] are returned first,
/// one per call. A failure set with [`MockRemoteFetcher::fail_always`] is
/// returned on every call after that. Unknown keys answer HTTP 404.
#[derive(Debug, Default)]
pub struct MockRemoteFetcher {
    traces: Mutex<HashMap<String, String>>,
    queued_failures: Mutex<VecDeque<FetchError>>,
    persistent_failure: Mutex<Option<FetchError>>,
    calls: Mutex<HashMap<String, usize>>,
    total_calls: AtomicUsize,
    delay: Duration,
}

impl MockRemoteFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated latency of every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_trace(self, key: impl Into<String>, table: impl Into<String>) -> Self {
        self.set_trace(key, table);
        self
    }

    /// Replace the canned trace for `key`.
    pub fn set_trace(&self, key: impl Into<String>, table: impl Into<String>) {
        locked(&self.traces).insert(key.into(), table.into());
    }

    /// Queue a failure for the next call.
    pub fn fail_next(&self, error: FetchError) {
        locked(&self.queued_failures).push_back(error);
    }

    /// Fail every call from now on, or stop doing so with `None`.
    pub fn fail_always(&self, error: Option<FetchError>) {
        *locked(&self.persistent_failure) = error;
    }

    /// Calls across all keys.
    pub fn calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        locked(&self.calls).get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteFetcher for MockRemoteFetcher {
    async fn fetch_raw_trace(&self, key: &str) -> Result<String, FetchError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *locked(&self.calls).entry(key.to_string()).or_default() += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(error) = locked(&self.queued_failures).pop_front() {
            return Err(error);
        }
        if let Some(error) = locked(&self.persistent_failure).clone() {
            return Err(error);
        }
        locked(&self.traces)
            .get(key)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                message: format!("no trace for {key}"),
            })
    }
}

/// [`ByteStorage`] wrapper whose writes and deletes can be made to fail.
#[derive(Debug)]
pub struct FaultyByteStorage<S: ByteStorage> {
    inner: Arc<S>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl<S: ByteStorage> FaultyByteStorage<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn injected(location: &str, op: &str) -> LapCacheError {
        StorageError::Io {
            location: location.to_string(),
            reason: format!("injected {op} failure"),
        }
        .into()
    }
}

#[async_trait]
impl<S: ByteStorage> ByteStorage for FaultyByteStorage<S> {
    async fn write(&self, location: &str, bytes: &[u8]) -> LapCacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected(location, "write"));
        }
        self.inner.write(location, bytes).await
    }

    async fn read(&self, location: &str) -> LapCacheResult<Vec<u8>> {
        self.inner.read(location).await
    }

    async fn delete(&self, location: &str) -> LapCacheResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected(location, "delete"));
        }
        self.inner.delete(location).await
    }

    async fn exists(&self, location: &str) -> LapCacheResult<bool> {
        self.inner.exists(location).await
    }

    async fn list(&self) -> LapCacheResult<Vec<String>> {
        self.inner.list().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for delimited telemetry tables.

    use super::*;
    use lapcache_storage::cache::NUMERIC_COLUMNS;
    use proptest::prelude::*;

    /// A canonical decimal with up to four fraction digits.
    pub fn arb_decimal() -> impl Strategy<Value = String> {
        (any::<bool>(), 0u64..100_000, 0usize..5, any::<u64>()).prop_map(
            |(negative, int, scale, frac_seed)| {
                let frac = if scale == 0 {
                    String::new()
                } else {
                    let modulus = 10u64.pow(scale as u32);
                    format!(".{:0width$}", frac_seed % modulus, width = scale)
                };
                let body = format!("{int}{frac}");
                let is_zero = body.bytes().all(|b| b == b'0' || b == b'.');
                if negative && !is_zero {
                    format!("-{body}")
                } else {
                    body
                }
            },
        )
    }

    /// Mostly decimals, with the odd literal a real export contains.
    pub fn arb_cell() -> impl Strategy<Value = String> {
        prop_oneof![
            8 => arb_decimal(),
            1 => prop::sample::select(vec!["", "N/A", "nan", "-0", "007", "1e5", "12.", "-.5"])
                .prop_map(str::to_string),
        ]
    }

    /// A column name, mostly from the delta-encoded set.
    pub fn arb_column_name() -> impl Strategy<Value = String> {
        prop_oneof![
            4 => prop::sample::select(NUMERIC_COLUMNS.to_vec()).prop_map(str::to_string),
            1 => prop::sample::select(vec!["Driver", "Sector", "Flag", "speed"])
                .prop_map(str::to_string),
        ]
    }

    /// A newline-terminated table with a header and 1..40 data rows.
    ///
    /// Some rows are truncated to exercise short-row handling.
    pub fn arb_trace_table() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_column_name(), 1..6).prop_flat_map(|header| {
            let width = header.len();
            let row = (
                prop::collection::vec(arb_cell(), width),
                prop::option::weighted(0.1, 0..width),
            )
                .prop_map(|(mut cells, truncate)| {
                    if let Some(keep) = truncate {
                        cells.truncate(keep.max(1));
                    }
                    cells.join(",")
                });
            prop::collection::vec(row, 1..40).prop_map(move |rows| {
                let mut table = header.join(",");
                table.push('\n');
                for row in rows {
                    table.push_str(&row);
                    table.push('\n');
                }
                table
            })
        })
    }

    /// A slowly varying numeric trace, the shape real laps have.
    pub fn arb_smooth_trace() -> impl Strategy<Value = String> {
        (20usize..200, 50u32..400, 1i64..50).prop_map(|(rows, start, step)| {
            fixtures::lap_trace_with(rows, start as f64, step as f64 / 100.0)
        })
    }

    /// A valid configuration with a small budget.
    pub fn arb_small_config() -> impl Strategy<Value = CacheConfig> {
        (200u64..5_000, 1u64..100).prop_map(|(max, file_pct)| {
            let file = (max * file_pct / 100).max(1);
            CacheConfig::new()
                .with_max_cache_size(max)
                .with_max_file_size(file)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built traces and configurations.

    use super::*;

    /// The two-row lap used throughout the docs.
    pub const SHORT_LAP: &str =
        "LapDistPct,Lat,Lon,Brake\n0.1,10.0,20.0,0.5\n0.2,10.5,20.1,0.6\n";

    /// A realistic trace with `rows` samples.
    pub fn lap_trace(rows: usize) -> String {
        lap_trace_with(rows, 120.0, 0.37)
    }

    /// A trace whose speed starts at `speed` and moves by `step` per sample.
    pub fn lap_trace_with(rows: usize, speed: f64, step: f64) -> String {
        let mut table = String::from("SessionTime,LapDistPct,Speed,Throttle,Brake,Gear,Driver\n");
        for i in 0..rows {
            let t = i as f64 / 60.0;
            let pct = i as f64 / rows.max(1) as f64;
            let v = speed + step * i as f64;
            let throttle = if i % 40 < 30 { 1.0 } else { 0.25 };
            let brake = if i % 40 < 30 { 0.0 } else { 0.8 };
            let gear = 3 + (i / 50) % 4;
            table.push_str(&format!(
                "{t:.4},{pct:.5},{v:.2},{throttle:.2},{brake:.2},{gear},VER\n"
            ));
        }
        table
    }

    /// A config with a tiny budget, fast retries and a short timeout.
    pub fn small_config(max_cache_size: u64, max_file_size: u64) -> CacheConfig {
        CacheConfig::new()
            .with_max_cache_size(max_cache_size)
            .with_max_file_size(max_file_size)
            .with_retry(fast_retry())
    }

    /// Three attempts, 10ms base backoff, 1s timeout.
    pub fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            backoff_base: Duration::from_millis(10),
            fetch_timeout: Duration::from_secs(1),
        }
    }

    /// Orchestrator over in-memory collaborators.
    pub type MemoryCache =
        CacheOrchestrator<MockRemoteFetcher, InMemoryKeyValueStore, InMemoryByteStorage>;

    /// Build an in-memory orchestrator, returning the collaborators too.
    pub fn memory_cache(
        config: CacheConfig,
        fetcher: MockRemoteFetcher,
    ) -> LapCacheResult<(
        MemoryCache,
        Arc<MockRemoteFetcher>,
        Arc<InMemoryKeyValueStore>,
        Arc<InMemoryByteStorage>,
    )> {
        let fetcher = Arc::new(fetcher);
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let storage = Arc::new(InMemoryByteStorage::new());
        let cache = CacheOrchestrator::new(
            config,
            Arc::clone(&fetcher),
            Arc::clone(&kv),
            Arc::clone(&storage),
        )?;
        Ok((cache, fetcher, kv, storage))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over lapcache results and cache state.

    use super::*;

    /// Assert that a result failed with a fetch error.
    #[track_caller]
    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &LapCacheResult<T>) {
        match result {
            Err(LapCacheError::Fetch(_)) => {}
            other => panic!("Expected Fetch error, got: {:?}", other),
        }
    }

    /// Assert that a result failed with a server-capacity error.
    #[track_caller]
    pub fn assert_capacity_error<T: std::fmt::Debug>(result: &LapCacheResult<T>) {
        match result {
            Err(LapCacheError::Fetch(e)) if e.is_capacity() => {}
            other => panic!("Expected capacity error, got: {:?}", other),
        }
    }

    /// Assert the global and per-file budgets hold for a usage report.
    #[track_caller]
    pub fn assert_within_budget(usage: &CacheUsage, config: &CacheConfig) {
        assert!(
            usage.total_size <= config.max_cache_size,
            "cache holds {} bytes, budget is {}",
            usage.total_size,
            config.max_cache_size
        );
        for entry in &usage.entries {
            assert!(
                entry.stored_size <= config.max_file_size,
                "{} stored {} bytes, per-file cap is {}",
                entry.key,
                entry.stored_size,
                config.max_file_size
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lap_trace_fixture_shape() {
        let table = fixtures::lap_trace(10);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 11);
        assert!(lines.iter().all(|l| l.split(',').count() == 7));
    }

    #[test]
    fn test_small_config_is_valid() {
        assert!(fixtures::small_config(1000, 100).validate().is_ok());
    }

    #[tokio::test]
    async fn test_mock_fetcher_script() {
        let fetcher = MockRemoteFetcher::new().with_trace("lap-1", fixtures::SHORT_LAP);
        fetcher.fail_next(FetchError::Network {
            reason: "reset".into(),
        });

        assert!(fetcher.fetch_raw_trace("lap-1").await.is_err());
        assert_eq!(
            fetcher.fetch_raw_trace("lap-1").await.unwrap(),
            fixtures::SHORT_LAP
        );
        assert!(matches!(
            fetcher.fetch_raw_trace("lap-2").await,
            Err(FetchError::HttpStatus { status: 404, .. })
        ));
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(fetcher.calls_for("lap-1"), 2);
    }

    #[tokio::test]
    async fn test_faulty_storage_injects_failures() {
        let storage = FaultyByteStorage::new(Arc::new(InMemoryByteStorage::new()));
        storage.write("a.trace", b"1").await.unwrap();

        storage.set_fail_writes(true);
        assert!(storage.write("b.trace", b"2").await.is_err());
        storage.set_fail_deletes(true);
        assert!(storage.delete("a.trace").await.is_err());
        assert!(storage.inner().exists("a.trace").await.unwrap());
    }

    proptest! {
        #[test]
        fn prop_generated_decimals_are_canonical(value in generators::arb_decimal()) {
            prop_assert!(!value.starts_with("-0") || value.starts_with("-0."));
            prop_assert!(!value.ends_with('.'));
        }

        #[test]
        fn prop_generated_tables_have_header_and_rows(table in generators::arb_trace_table()) {
            prop_assert!(table.ends_with('\n'));
            prop_assert!(table.lines().count() >= 2);
        }
    }
}
