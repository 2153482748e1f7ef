//! Error types for lapcache operations

use std::time::Duration;
use thiserror::Error;

/// Storage layer errors (key-value store, device byte storage).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Payload not found at {location}")]
    NotFound { location: String },

    #[error("I/O failed at {location}: {reason}")]
    Io { location: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// True when the error means "the bytes are simply not there".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Delta codec errors. Only raised while decoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed delta token {cell:?} at row {row}, column {column}")]
    MalformedToken {
        row: usize,
        column: usize,
        cell: String,
    },

    #[error("Value at row {row}, column {column} is not representable at scale {scale}")]
    InexactScale {
        row: usize,
        column: usize,
        scale: u32,
    },

    #[error("Delta column {column} is out of range for {width} columns")]
    ColumnOutOfRange { column: usize, width: usize },

    #[error("Numeric overflow at row {row}, column {column}")]
    Overflow { row: usize, column: usize },
}

/// Remote fetch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Request failed with status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Server capacity exceeded: {reason}")]
    ServerCapacity { reason: String },

    #[error("Remote returned an empty trace for {key}")]
    EmptyPayload { key: String },

    #[error("Fetch for {key} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("Fetch task aborted: {reason}")]
    Aborted { reason: String },
}

impl FetchError {
    /// Classify a non-success HTTP response.
    ///
    /// 507, or a 5xx whose body talks about memory or payload size, is a
    /// capacity failure and must not be retried.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        let lowered = message.to_ascii_lowercase();
        let capacity_hint = ["memory", "capacity", "too large"]
            .iter()
            .any(|needle| lowered.contains(needle));

        if status == 507 || (status >= 500 && capacity_hint) {
            Self::ServerCapacity { reason: message }
        } else {
            Self::HttpStatus { status, message }
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ServerCapacity { .. } | Self::EmptyPayload { .. } | Self::RetriesExhausted { .. }
        )
    }

    /// Whether this error (or the last attempt behind it) is a capacity failure.
    pub fn is_capacity(&self) -> bool {
        match self {
            Self::ServerCapacity { .. } => true,
            Self::RetriesExhausted { last, .. } => last.is_capacity(),
            _ => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Stored bytes no longer match their metadata.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorruptionError {
    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Payload for {key} is not valid UTF-8")]
    InvalidUtf8 { key: String },

    #[error("Payload for {key} failed to decode: {source}")]
    Undecodable { key: String, source: CodecError },
}

/// Master error type for all lapcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LapCacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Corruption detected: {0}")]
    Corruption(#[from] CorruptionError),
}

/// Result type alias for lapcache operations.
pub type LapCacheResult<T> = Result<T, LapCacheError>;

// =============================================================================
// TESTS
// =============================================================================
