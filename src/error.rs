//! Error types for the fetchurl CAS cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the fetchurl CAS cache
#[derive(Error, Debug)]
pub enum Error {
    /// Requested hash algorithm is not in the supported set
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Downloaded content did not hash to the expected digest
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Bytes were already written to the output sink before the failure,
    /// so falling back to another source is unsafe
    #[error("partial write: {source}")]
    PartialWrite {
        #[source]
        source: Box<Error>,
    },

    /// No server or direct source could provide the content
    #[error("all sources failed: {source}")]
    AllSourcesFailed {
        #[source]
        source: Box<Error>,
    },

    /// A source responded with a non-200 status code
    #[error("unexpected status {code}")]
    HttpStatus { code: u16 },

    /// Content is not present in any repository or source
    #[error("hash not found: {algo}/{hash}")]
    NotFound { algo: String, hash: String },

    /// A source responded 200 but did not commit to a Content-Length
    #[error("source did not provide Content-Length: {url}")]
    MissingContentLength { url: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Link database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Eviction capacity check failed
    #[error("capacity check failed: {0}")]
    CapacityCheckFailed(String),

    /// Eviction strategy not found in the registry
    #[error("eviction strategy not found: {0}")]
    StrategyNotFound(String),

    /// Certificate loading or generation error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap this error as a partial-write failure.
    pub fn into_partial_write(self) -> Error {
        Error::PartialWrite {
            source: Box::new(self),
        }
    }

    /// True if this error (or any error in its chain) is a hash mismatch.
    pub fn is_hash_mismatch(&self) -> bool {
        match self {
            Error::HashMismatch { .. } => true,
            Error::PartialWrite { source } | Error::AllSourcesFailed { source } => {
                source.is_hash_mismatch()
            }
            _ => false,
        }
    }

    /// True if this error (or any error in its chain) is a partial write.
    pub fn is_partial_write(&self) -> bool {
        match self {
            Error::PartialWrite { .. } => true,
            Error::AllSourcesFailed { source } => source.is_partial_write(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_write_wraps_cause() {
        let err = Error::HashMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        }
        .into_partial_write();

        assert!(err.is_partial_write());
        assert!(err.is_hash_mismatch());
        assert!(err.to_string().contains("partial write"));
    }

    #[test]
    fn test_http_status_display() {
        let err = Error::HttpStatus { code: 403 };
        assert_eq!(err.to_string(), "unexpected status 403");
    }

    #[test]
    fn test_all_sources_failed_preserves_chain() {
        let err = Error::AllSourcesFailed {
            source: Box::new(Error::HttpStatus { code: 404 }),
        };
        assert!(!err.is_hash_mismatch());
        assert!(err.to_string().contains("all sources failed"));
    }
}
