//! Shared error taxonomy for the sync core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures crossing module boundaries inside the sync core.
///
/// Remote failures keep their [`store::StoreError`] classification so the
/// engine can distinguish retryable trouble from conditions that suspend a
/// path until an operator looks at it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The path matches an exclusion pattern and is never synced.
    #[error("path is excluded from sync: {0}")]
    Excluded(String),

    /// A write would exceed the configured maximum file size. Reported to
    /// the caller before any byte lands.
    #[error("file size {size} exceeds the configured limit of {limit} bytes")]
    SizeLimit { size: u64, limit: u64 },

    /// Content failed its integrity check (hash mismatch or ciphertext
    /// authentication failure). The affected versions are retained, never
    /// discarded.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("metadata store error: {0}")]
    Metadata(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A logical path escaped the cache root or contained forbidden
    /// components.
    #[error("invalid logical path: {0}")]
    InvalidPath(String),
}

impl SyncError {
    /// Whether the failure is worth retrying on a later sync cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store(err) => err.is_transient(),
            SyncError::Io(_) | SyncError::Metadata(_) => true,
            _ => false,
        }
    }
}
