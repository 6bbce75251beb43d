//! Error types for chronomesh

/// Result type alias for chronomesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for chronomesh
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Metadata store errors (transport, serialization, contention)
    #[error("Meta store error: {0}")]
    MetaStore(#[from] MetaStoreError),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// Capacity limit reached (reserved, not currently raised)
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures surfaced by a [`MetaStore`](crate::metadata::MetaStore) backend.
///
/// All backend failures collapse into one error kind so callers can treat
/// "the coordination service let us down" uniformly: log, return false,
/// and let observer-driven reconciliation catch up.
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    /// Transport-level failure talking to the coordination service
    #[error("transport error: {0}")]
    Transport(String),
    /// Stored metadata could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Lock contention or conflicting concurrent update
    #[error("contention: {0}")]
    Contention(String),
    /// The backend session expired; held locks are gone
    #[error("session lost: {0}")]
    SessionLost(String),
}

impl From<std::io::Error> for MetaStoreError {
    fn from(e: std::io::Error) -> Self {
        MetaStoreError::Transport(e.to_string())
    }
}
