//! Error types for blockcache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache and its storage engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Argument / Configuration Errors
    // =========================================================================
    /// Invalid argument passed to a cache operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Value exceeds the configured maximum length
    #[error("Value of {len} bytes exceeds the maximum of {max} bytes")]
    ValueTooLarge { len: usize, max: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// I/O error from a storage backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Access outside the bounds of a storage block
    #[error("Access of {len} bytes at offset {offset} exceeds block capacity {capacity}")]
    OutOfBounds {
        offset: u64,
        len: u64,
        capacity: u64,
    },

    /// Off-heap region allocation failed
    #[error("Off-heap allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation on a closed cache or released storage
    #[error("Cache is closed")]
    Closed,

    /// close() called more than once
    #[error("Cache has already been closed")]
    AlreadyClosed,

    /// Inconsistent internal state (teardown races and similar)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    // =========================================================================
    // Encoding Errors
    // =========================================================================
    /// JSON (de)serialization failed: config files and typed values
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors caused by the caller's input rather than the engine
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::ValueTooLarge { .. } | Error::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_too_large_message() {
        let err = Error::ValueTooLarge { len: 10, max: 4 };
        assert_eq!(
            err.to_string(),
            "Value of 10 bytes exceeds the maximum of 4 bytes"
        );
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_invalid_argument());
    }
}
