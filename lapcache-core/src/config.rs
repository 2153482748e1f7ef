//! Configuration types

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Retry policy for remote trace fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_retries: u32,
    /// Delay after failed attempt `i` (0-based) is `backoff_base * 2^i`.
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,
    /// Per-attempt timeout. Trace payloads are large, so this is generous.
    #[serde(with = "duration_millis")]
    pub fetch_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given 0-based attempt failed.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Configuration for the on-device trace cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When off every request goes straight to the remote.
    pub enabled: bool,
    /// Hard budget for the sum of stored payload sizes, in bytes.
    pub max_cache_size: u64,
    /// Largest single encoded payload that will be written, in bytes.
    pub max_file_size: u64,
    /// Fraction of `max_cache_size` above which maintenance eviction kicks in.
    pub cleanup_threshold: f64,
    /// Fraction of `max_cache_size` that maintenance eviction shrinks to.
    pub cleanup_target: f64,
    /// Key under which the metadata map is stored.
    pub metadata_key: String,
    /// Key under which the payload-handle list is stored.
    pub handles_key: String,
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_size: 200 * MIB,
            max_file_size: 20 * MIB,
            cleanup_threshold: 0.8,
            cleanup_target: 0.7,
            metadata_key: "lapcache.metadata.v1".to_string(),
            handles_key: "lapcache.handles.v1".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the total size budget.
    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Set the per-entry size cap.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Set the maintenance threshold and target fractions.
    pub fn with_cleanup(mut self, threshold: f64, target: f64) -> Self {
        self.cleanup_threshold = threshold;
        self.cleanup_target = target;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Byte level above which maintenance eviction runs.
    pub fn cleanup_threshold_bytes(&self) -> u64 {
        (self.max_cache_size as f64 * self.cleanup_threshold) as u64
    }

    /// Byte level maintenance eviction shrinks to.
    pub fn cleanup_target_bytes(&self) -> u64 {
        (self.max_cache_size as f64 * self.cleanup_target) as u64
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(invalid("max_cache_size", self.max_cache_size, "must be non-zero"));
        }
        if self.max_file_size == 0 {
            return Err(invalid("max_file_size", self.max_file_size, "must be non-zero"));
        }
        if self.max_file_size > self.max_cache_size {
            return Err(invalid(
                "max_file_size",
                self.max_file_size,
                "must not exceed max_cache_size",
            ));
        }
        if !(self.cleanup_threshold > 0.0 && self.cleanup_threshold <= 1.0) {
            return Err(invalid(
                "cleanup_threshold",
                self.cleanup_threshold,
                "must be in (0, 1]",
            ));
        }
        if !(self.cleanup_target > 0.0 && self.cleanup_target < self.cleanup_threshold) {
            return Err(invalid(
                "cleanup_target",
                self.cleanup_target,
                "must be in (0, cleanup_threshold)",
            ));
        }
        if self.metadata_key.is_empty() || self.metadata_key == self.handles_key {
            return Err(invalid(
                "metadata_key",
                &self.metadata_key,
                "must be non-empty and distinct from handles_key",
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", 0, "at least one attempt is required"));
        }
        if self.retry.fetch_timeout.is_zero() {
            return Err(invalid("retry.fetch_timeout", "0ms", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
