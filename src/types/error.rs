//! Error types for the REM database.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Database error taxonomy.
///
/// Grouped by who is expected to act on the error:
/// - Input errors (caller's fault): surfaced directly, no retry.
/// - Capacity errors: caller may retry.
/// - Transient dependency errors: writes still commit; vector records are
///   marked stale instead of failing the batch.
/// - Replication errors: handled by reconnect/backoff, reported via status.
/// - Fatal errors: the node refuses further writes until operator action.
#[derive(Error, Debug)]
pub enum DatabaseError {
    // --- Input errors ---
    #[error("Schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("Schema not found: {0}")]
    SchemaUnknown(String),

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Bad query: {0}")]
    BadQuery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // --- Capacity errors ---
    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // --- Transient dependency errors ---
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    // --- Replication ---
    #[error("Replication error: {0}")]
    ReplicationError(String),

    #[error("Node is a read-only follower")]
    ReadOnlyReplica,

    // --- Fatal ---
    #[error("Fatal corruption: {0}")]
    FatalCorruption(String),

    // --- Infrastructure ---
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[error("UUID error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl DatabaseError {
    /// Process exit code for the CLI: 1 for caller mistakes, 2 for system
    /// failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            DatabaseError::SchemaInvalid(_)
            | DatabaseError::SchemaUnknown(_)
            | DatabaseError::SchemaConflict(_)
            | DatabaseError::ValidationFailed(_)
            | DatabaseError::BadQuery(_)
            | DatabaseError::NotFound(_)
            | DatabaseError::ReadOnlyReplica => 1,
            _ => 2,
        }
    }

    /// Whether the node must stop accepting writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DatabaseError::FatalCorruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DatabaseError::BadQuery("x".into()).exit_code(), 1);
        assert_eq!(DatabaseError::NotFound("x".into()).exit_code(), 1);
        assert_eq!(DatabaseError::StorageError("x".into()).exit_code(), 2);
        assert_eq!(DatabaseError::FatalCorruption("x".into()).exit_code(), 2);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DatabaseError::FatalCorruption("bad block".into()).is_fatal());
        assert!(!DatabaseError::Timeout("slow".into()).is_fatal());
    }
}
