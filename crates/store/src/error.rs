//! Error taxonomy for remote storage operations.
//!
//! Every backend failure is classified up front: transient failures are
//! eligible for retry, everything else surfaces to the caller immediately.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by [`crate::BucketClient`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Timeouts, 5xx responses, connection resets. Retried with backoff.
    #[error("transient storage failure: {message}")]
    Transient { message: String },

    /// The retry budget for a transient failure ran out.
    #[error("storage operation failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// Credentials rejected or insufficient permissions. Never retried.
    #[error("storage backend rejected credentials for {key}: {message}")]
    Auth { key: String, message: String },

    /// The object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The bucket refused the write for capacity reasons.
    #[error("storage quota exceeded for {key}: {message}")]
    Quota { key: String, message: String },

    /// A version-guarded put found a different remote version. This is the
    /// signal the sync engine turns into conflict resolution.
    #[error("remote version changed under {0}")]
    VersionMismatch(String),

    /// The logical path cannot be expressed as an object key.
    #[error("invalid object key {key}: {message}")]
    InvalidKey { key: String, message: String },

    /// The backend does not implement the requested operation.
    #[error("operation not supported by storage backend: {0}")]
    Unsupported(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, StoreError::VersionMismatch(_))
    }
}

/// Map a backend error onto the retry taxonomy.
///
/// Anything we cannot positively identify as permanent is treated as
/// transient; the retry budget caps how long that optimism lasts.
pub(crate) fn classify(err: object_store::Error) -> StoreError {
    use object_store::Error;

    match err {
        Error::NotFound { path, .. } => StoreError::NotFound(path),
        Error::Precondition { path, .. } | Error::AlreadyExists { path, .. } => {
            StoreError::VersionMismatch(path)
        }
        Error::Unauthenticated { path, source } => StoreError::Auth {
            key: path,
            message: source.to_string(),
        },
        Error::PermissionDenied { path, source } => {
            let message = source.to_string();
            if message.to_ascii_lowercase().contains("quota") {
                StoreError::Quota { key: path, message }
            } else {
                StoreError::Auth { key: path, message }
            }
        }
        Error::InvalidPath { source } => StoreError::InvalidKey {
            key: String::new(),
            message: source.to_string(),
        },
        Error::NotImplemented => StoreError::Unsupported("not implemented".to_string()),
        Error::NotSupported { source } => StoreError::Unsupported(source.to_string()),
        other => StoreError::Transient {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_permanent() {
        let err = classify(object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        });
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_precondition_maps_to_version_mismatch() {
        let err = classify(object_store::Error::Precondition {
            path: "a/b".to_string(),
            source: "etag mismatch".into(),
        });
        assert!(err.is_version_mismatch());
    }

    #[test]
    fn test_generic_is_transient() {
        let err = classify(object_store::Error::Generic {
            store: "S3",
            source: "connection reset by peer".into(),
        });
        assert!(err.is_transient());
    }
}
