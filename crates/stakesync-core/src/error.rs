//! Error types for stakesync-core

use thiserror::Error;

/// Result type alias using stakesync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stakesync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed mutation or payload; dropped and never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dead-lettered mutation or unresolvable schema mismatch
    #[error("Fatal sync error: {0}")]
    FatalSync(String),

    /// Entity or mutation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server transport failure surfaced outside a sync cycle
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Transient failures talking to the sync server.
///
/// Every variant is retryable: the mutation keeps its place in the queue and
/// its attempt counter is bumped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Sync server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Invalid sync server response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(0)
        } else if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}
