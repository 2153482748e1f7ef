//! Remote fetch with per-attempt timeout and exponential backoff.

use lapcache_core::{FetchError, RetryConfig};
use tracing::{debug, warn};

use super::traits::RemoteFetcher;

/// Fetch the raw trace for `key`, retrying transient failures.
///
/// - Each attempt is bounded by `fetch_timeout`; a timeout counts as a
///   failed attempt.
/// - After failed attempt `i` (0-based) the task sleeps `backoff_base * 2^i`.
/// - Capacity failures and empty payloads fail immediately.
/// - When every attempt fails the last error is wrapped in
///   [`FetchError::RetriesExhausted`].
pub async fn fetch_with_retry<R>(
    fetcher: &R,
    key: &str,
    policy: &RetryConfig,
) -> Result<String, FetchError>
where
    R: RemoteFetcher + ?Sized,
{
    let attempts = policy.max_retries.max(1);
    let mut last = None;

    for attempt in 0..attempts {
        let result = tokio::time::timeout(policy.fetch_timeout, fetcher.fetch_raw_trace(key))
            .await
            .unwrap_or(Err(FetchError::Timeout {
                after: policy.fetch_timeout,
            }));

        let err = match result {
            Ok(raw) if raw.trim().is_empty() => FetchError::EmptyPayload {
                key: key.to_string(),
            },
            Ok(raw) => {
                debug!(key, attempt, bytes = raw.len(), "fetched trace");
                return Ok(raw);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            warn!(key, attempt, error = %err, "trace fetch failed, not retrying");
            return Err(err);
        }

        warn!(key, attempt, error = %err, "trace fetch attempt failed");
        last = Some(err);
        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }
    }

    Err(FetchError::RetriesExhausted {
        key: key.to_string(),
        attempts,
        last: Box::new(last.unwrap_or(FetchError::Aborted {
            reason: "no attempt was made".to_string(),
        })),
    })
}
