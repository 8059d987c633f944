//! Error types for duracache
//!
//! This module defines the common error types used throughout the system.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for duracache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for duracache
#[derive(Debug, Error)]
pub enum Error {
    #[error("item not found")]
    NotFound,

    #[error("value is not cloneable")]
    NotCloneable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error in {path}: {detail}")]
    Encode { path: PathBuf, detail: String },

    #[error("decode error in {path}: {detail}")]
    Decode { path: PathBuf, detail: String },

    #[error("operation requested after shutdown")]
    Shutdown,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an encode error naming the file being written
    pub fn encode(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Encode {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a decode error naming the offending file
    pub fn decode(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if this error originated in the persistence layer
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Encode { .. } | Self::Decode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::NotCloneable.is_not_found());
        assert!(Error::decode("/tmp/seg", "bad magic").is_persistence());
        assert!(!Error::Shutdown.is_persistence());
    }

    #[test]
    fn test_decode_error_names_file() {
        let err = Error::decode("/data/cache/1700000000000", "CRC mismatch");
        let msg = err.to_string();
        assert!(msg.contains("/data/cache/1700000000000"));
        assert!(msg.contains("CRC mismatch"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(err.is_persistence());
    }
}
