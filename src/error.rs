//! Domain error type shared by the store and mirror layers.
//!
//! HTTP handlers and `main` wrap these in `anyhow`/`AppError` at the edges;
//! inside the mirror the variants stay distinguishable so callers can react
//! to an absent key or a busy entry-point lock without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// An entry-point recomputation is already running.
    #[error("a synchronization is already running")]
    SyncInProgress,

    /// The requested store key is absent (or holds an empty value).
    #[error("no value available")]
    EmptyKey,

    /// The store file could not be opened or locked.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// An upstream fetch exhausted its retry budget.
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    /// JSON (de)serialization of a store record failed.
    #[error("marshalling failed: {0}")]
    Marshal(#[from] serde_json::Error),

    /// Gzip encoding or decoding of a stored payload failed.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] std::io::Error),

    /// A store transaction failed.
    #[error("store operation failed: {0}")]
    Store(#[from] Box<redb::Error>),
}

impl From<redb::TransactionError> for MirrorError {
    fn from(err: redb::TransactionError) -> Self {
        MirrorError::Store(Box::new(err.into()))
    }
}

impl From<redb::TableError> for MirrorError {
    fn from(err: redb::TableError) -> Self {
        MirrorError::Store(Box::new(err.into()))
    }
}

impl From<redb::StorageError> for MirrorError {
    fn from(err: redb::StorageError) -> Self {
        MirrorError::Store(Box::new(err.into()))
    }
}

impl From<redb::CommitError> for MirrorError {
    fn from(err: redb::CommitError) -> Self {
        MirrorError::Store(Box::new(err.into()))
    }
}
