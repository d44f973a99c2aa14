//! Error types for the Plan B shard store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlanBError>;

#[derive(Error, Debug)]
pub enum PlanBError {
    /// The guard protecting a resource has been destroyed. Callers re-read
    /// the owner's current reference and retry.
    #[error("Resource is being closed, try again")]
    TryAgain,

    #[error("Gave up after {0} attempts against a rotating resource")]
    Busy(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Operation '{0}' is not supported by this shard")]
    Unsupported(&'static str),

    #[error("Database is already closed: {0}")]
    AlreadyClosed(String),

    #[error("Snapshot fetch failed for '{map}': {reason}")]
    Fetch { map: String, reason: String },

    #[error("Snapshot for '{0}' has not changed")]
    SnapshotNotModified(String),

    #[error("No snapshot available for '{map}': {reason}")]
    SnapshotUnavailable { map: String, reason: String },

    #[error("Staged file {0} not found")]
    StagedFileNotFound(i64),

    #[error("Shard '{0}' not found")]
    ShardNotFound(String),

    #[error("Invalid map name: {0}")]
    InvalidName(String),

    #[error("Content hash mismatch: expected {expected}, found {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PlanBError {
    /// Stable error code for logs and remote callers
    pub fn code(&self) -> &'static str {
        match self {
            PlanBError::TryAgain => "TRY_AGAIN",
            PlanBError::Busy(_) => "BUSY",
            PlanBError::Unsupported(_) => "UNSUPPORTED",
            PlanBError::AlreadyClosed(_) => "ALREADY_CLOSED",
            PlanBError::Fetch { .. } => "FETCH_FAILED",
            PlanBError::SnapshotNotModified(_) => "NOT_MODIFIED",
            PlanBError::SnapshotUnavailable { .. } => "SNAPSHOT_UNAVAILABLE",
            PlanBError::StagedFileNotFound(_) => "STAGED_FILE_NOT_FOUND",
            PlanBError::ShardNotFound(_) => "SHARD_NOT_FOUND",
            PlanBError::InvalidName(_) => "INVALID_NAME",
            PlanBError::HashMismatch { .. } => "HASH_MISMATCH",
            PlanBError::Config(_) => "CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for races that resolve by retrying against a fresh reference.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlanBError::TryAgain)
    }

    /// True when retrying the same input can never succeed: malformed or
    /// corrupt data, bad names, misuse.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PlanBError::InvalidFormat(_)
                | PlanBError::Serialization(_)
                | PlanBError::Json(_)
                | PlanBError::InvalidName(_)
                | PlanBError::HashMismatch { .. }
                | PlanBError::Unsupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(PlanBError::TryAgain.code(), "TRY_AGAIN");
        assert_eq!(PlanBError::Unsupported("merge").code(), "UNSUPPORTED");
        assert_eq!(
            PlanBError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_only_try_again_is_retryable() {
        assert!(PlanBError::TryAgain.is_retryable());
        assert!(!PlanBError::Busy(3).is_retryable());
        assert!(!PlanBError::AlreadyClosed("x".into()).is_retryable());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(PlanBError::InvalidFormat("not a directory".into()).is_permanent());
        assert!(PlanBError::InvalidName("a/b".into()).is_permanent());
        assert!(!PlanBError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).is_permanent());
        assert!(!PlanBError::TryAgain.is_permanent());
        assert!(!PlanBError::Busy(10).is_permanent());
    }
}
