//! Error types for CSFLE operations.

use std::time::Duration;

/// Main error type for key provisioning, schema building and client operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading or writing a local file (usually the master key) failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing store could not be reached or the connection string is malformed
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation attempted on a client handle that has been released
    #[error("connection closed: the client handle has been released")]
    ConnectionClosed,

    /// A store operation did not complete within the configured timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Missing or malformed required input (schema, data key id, namespace, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write violated a unique index (e.g. a duplicate key alias)
    #[error("conflict: {0}")]
    Conflict(String),

    /// The unique alias index on the key vault could not be created
    #[error("failed to create unique alias index on key vault: {0}")]
    IndexCreation(String),

    /// Key material has the wrong size
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length in bytes
        expected: usize,
        /// Length actually found
        actual: usize,
    },

    /// Field encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Field decryption failed
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Equality query against a field encrypted with the randomized algorithm
    #[error("field `{field}` uses randomized encryption and cannot be queried")]
    UnsupportedQuery {
        /// Dotted path of the offending field
        field: String,
    },

    /// Configuration file could not be parsed or failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Any other failure reported by the backing store
    #[error("store error: {0}")]
    Store(String),

    /// JSON (de)serialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` when the caller may retry the operation, possibly with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_) | Self::Conflict(_))
    }

    /// Returns `true` for errors that will not go away without operator intervention.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::InvalidArgument(_)
                | Self::InvalidKeyLength { .. }
                | Self::IndexCreation(_)
                | Self::Config(_)
        )
    }
}
