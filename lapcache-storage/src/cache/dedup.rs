//! Coalescing of concurrent identical requests.
//!
//! The first caller for a signature spawns the operation on the runtime and
//! registers a [`Shared`] handle to its outcome. Later callers with the same
//! signature await that handle instead of starting their own. The operation
//! runs to completion even if every caller goes away, and its signature is
//! dropped from the registry as soon as it finishes, success or failure.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use lapcache_core::{FetchError, LapCacheResult};
use tracing::debug;

type SharedOutcome<T> = Shared<BoxFuture<'static, LapCacheResult<T>>>;
type Registry<T> = Arc<Mutex<HashMap<String, SharedOutcome<T>>>>;

/// Canonical identity of a request: method, resource, and parameters sorted
/// by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSignature {
    method: String,
    resource: String,
    params: BTreeMap<String, String>,
}

impl RequestSignature {
    pub fn new(method: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter. A repeated name keeps the last value.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Signature for fetching the trace of one lap.
    pub fn trace(key: &str) -> Self {
        Self::new("GET", "trace").with_param("key", key)
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.resource)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

/// Keyed registry of in-flight operations.
pub struct RequestDeduplicator<T> {
    inflight: Registry<T>,
}

impl<T> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Removes a signature from the registry when the owning task ends, even
/// if the operation panicked.
struct Completion<T> {
    signature: String,
    inflight: Registry<T>,
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.signature);
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` under `signature`, or join the run already in flight.
    ///
    /// `op` is only invoked when no run for `signature` is outstanding.
    /// Every joined caller observes the same value or error. Must be called
    /// from within a tokio runtime.
    pub async fn run<F, Fut>(&self, signature: &RequestSignature, op: F) -> LapCacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LapCacheResult<T>> + Send + 'static,
    {
        let signature = signature.to_string();
        let outcome = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(existing) = inflight.get(&signature) {
                debug!(signature = %signature, "joining in-flight request");
                existing.clone()
            } else {
                // The guard re-locks the registry on drop, and the registry
                // is locked here, so it must not exist while `op()` runs.
                let work = op();
                let completion = Completion {
                    signature: signature.clone(),
                    inflight: Arc::clone(&self.inflight),
                };
                // The registry lock is held until the entry is inserted, so
                // the task cannot deregister before it is registered.
                let task = tokio::spawn(async move {
                    let _completion = completion;
                    work.await
                });
                let outcome = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(FetchError::Aborted {
                            reason: e.to_string(),
                        }
                        .into())
                    })
                }
                .boxed()
                .shared();
                inflight.insert(signature, outcome.clone());
                outcome
            }
        };
        outcome.await
    }

    /// Number of signatures currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
