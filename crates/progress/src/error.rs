//! Error taxonomy of the progression engine.

use studyphase_storage::StorageError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ProgressError>;

/// Errors surfaced by phase configuration, bootstrap and progress tracking.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    /// Malformed input, rejected before any write
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown study, patient, phase or template
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transaction contention that outlived the retry budget
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backing store unavailable or failing
    #[error("Dependency failure: {0}")]
    Dependency(String),
}

impl ProgressError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProgressError::Conflict(_) | ProgressError::Dependency(_))
    }

    /// Whether an event that hit this error should be dropped rather than retried.
    pub fn is_drop(&self) -> bool {
        matches!(self, ProgressError::NotFound(_))
    }
}

impl From<StorageError> for ProgressError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => ProgressError::Conflict(msg),
            other => ProgressError::Dependency(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let conflict: ProgressError = StorageError::Conflict("v2".into()).into();
        assert!(matches!(conflict, ProgressError::Conflict(_)));
        assert!(conflict.is_retryable());

        let io: ProgressError =
            StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).into();
        assert!(matches!(io, ProgressError::Dependency(_)));
        assert!(io.is_retryable());

        let invalid: ProgressError = StorageError::Other("bad id".into()).into();
        assert!(matches!(invalid, ProgressError::Dependency(_)));
        assert!(!invalid.is_drop());

        let missing = ProgressError::NotFound("x".into());
        assert!(missing.is_drop());
        assert!(!missing.is_retryable());
    }
}
