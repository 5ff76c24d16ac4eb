//! Error types for cache operations
//!
//! Only `Configuration`, `Cancelled` and `Io` failures while reading declared
//! inputs ever stop a unit of work. Everything else degrades: a network or
//! corrupt-entry failure becomes a cache miss, a failed store becomes
//! "not cached this run".

use std::path::Path;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Error type for cache, fingerprint and state operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O error on the local file system
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    Io {
        #[source]
        source: std::io::Error,
        path: Option<Box<Path>>,
        operation: String,
    },

    /// Remote cache unreachable, timed out, or answered with an unexpected status
    #[error("Remote cache {operation} failed: {message}")]
    Network { operation: String, message: String },

    /// A stored entry failed its integrity check
    #[error("Corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Invalid cache configuration (surfaced before any work runs)
    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    /// Execution state store failure
    #[error("Execution state error: {message}")]
    State { message: String },

    /// Build-wide cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,
}

impl CacheError {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    #[must_use]
    pub fn network(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn corrupt(key: impl ToString, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Whether this error aborts the build no matter which operation raised it
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Cancelled)
    }
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        Self::state(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path() {
        let err = CacheError::io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/tmp/missing.txt",
            "read",
        );
        let message = err.to_string();
        assert!(message.contains("read"));
        assert!(message.contains("/tmp/missing.txt"));
    }

    #[test]
    fn test_degradable_errors_are_not_fatal() {
        assert!(!CacheError::network("load", "connection refused").is_fatal());
        assert!(!CacheError::corrupt("abcd", "digest mismatch").is_fatal());
        assert!(CacheError::configuration("unknown remote type").is_fatal());
        assert!(CacheError::Cancelled.is_fatal());
    }
}
