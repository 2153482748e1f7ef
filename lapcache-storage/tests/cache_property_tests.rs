//! Property-Based Tests for Cache Budgets and Eviction
//!
//! Property: after any sequence of reads and writes, the sum of stored sizes
//! stays within `max_cache_size` and no entry exceeds `max_file_size`.
//!
//! This validates:
//! - The hard budget holds after every insertion
//! - Maintenance eviction never leaves the cache above its threshold
//! - Metadata and payloads stay in step

use lapcache_storage::{storage_location_for, ByteStorage};
use lapcache_test_utils::assertions::assert_within_budget;
use lapcache_test_utils::fixtures::{fast_retry, lap_trace, memory_cache};
use lapcache_test_utils::generators::arb_small_config;
use lapcache_test_utils::MockRemoteFetcher;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Get(u8),
    Write(u8, usize),
    Invalidate(u8),
    Maintain,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..12).prop_map(Op::Get),
        4 => (0u8..12, 1usize..120).prop_map(|(k, rows)| Op::Write(k, rows)),
        1 => (0u8..12).prop_map(Op::Invalidate),
        1 => Just(Op::Maintain),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: budgets hold after every operation.
    #[test]
    fn prop_budget_invariant(
        config in arb_small_config(),
        ops in prop::collection::vec(arb_op(), 1..40),
    ) {
        let config = config.with_retry(fast_retry());
        let fetcher = MockRemoteFetcher::new();
        for k in 0..12u8 {
            fetcher.set_trace(format!("lap-{k}"), lap_trace(5 + k as usize * 3));
        }

        runtime().block_on(async {
            let (cache, _fetcher, _kv, storage) = memory_cache(config.clone(), fetcher).unwrap();

            for op in &ops {
                match op {
                    Op::Get(k) => {
                        cache.get_trace(&format!("lap-{k}")).await.unwrap();
                    }
                    Op::Write(k, rows) => {
                        let _ = cache.try_cache(&format!("lap-{k}"), &lap_trace(*rows)).await.unwrap();
                    }
                    Op::Invalidate(k) => {
                        cache.invalidate(&format!("lap-{k}")).await.unwrap();
                    }
                    Op::Maintain => {
                        cache.maintain().await.unwrap();
                        let usage = cache.stats().await.unwrap();
                        assert!(usage.total_size <= config.cleanup_threshold_bytes());
                    }
                }

                let usage = cache.stats().await.unwrap();
                assert_within_budget(&usage, &config);

                // Every indexed entry has its payload, and nothing else is stored.
                let mut stored = storage.list().await.unwrap();
                stored.sort();
                let mut indexed: Vec<String> = usage
                    .entries
                    .iter()
                    .map(|e| storage_location_for(&e.key))
                    .collect();
                indexed.sort();
                assert_eq!(stored, indexed);
            }
        });
    }

    /// Property: the least recently used entry is the first to go.
    #[test]
    fn prop_eviction_prefers_oldest(sizes in prop::collection::vec(20usize..60, 3..8)) {
        runtime().block_on(async {
            let (cache, _fetcher, _kv, _storage) = memory_cache(
                lapcache_test_utils::fixtures::small_config(100, 60),
                MockRemoteFetcher::new(),
            )
            .unwrap();

            for (i, size) in sizes.iter().enumerate() {
                let before = cache.stats().await.unwrap();
                let table = format!("Driver\n{}\n", "x".repeat(size - 8));
                cache.try_cache(&format!("k{i}"), &table).await.unwrap();
                let after = cache.stats().await.unwrap();

                // Survivors are always the most recently used of the earlier entries.
                let survivors: Vec<&str> = before
                    .entries
                    .iter()
                    .map(|e| e.key.as_str())
                    .filter(|k| after.entries.iter().any(|a| a.key == *k))
                    .collect();
                let expected: Vec<&str> = before
                    .entries
                    .iter()
                    .map(|e| e.key.as_str())
                    .take(survivors.len())
                    .collect();
                assert_eq!(survivors, expected);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        });
    }
}
