//! Storage error types.
//!
//! Defines errors that can occur during storage operations:
//! - `NotFound`: Requested record doesn't exist
//! - `Conflict`: Instance revision moved since it was loaded
//! - `DuplicateSignature`: Replay guard already holds the signature
//! - `Serialization`: Failed to encode/decode data
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Instance revision conflict
    ///
    /// Another writer saved or deleted the instance between our load and our
    /// commit. The whole step is retried against the fresh state.
    #[error("revision conflict: expected {expected}, got {got}")]
    Conflict {
        /// Revision the writer loaded (0 means "absent")
        expected: u64,
        /// Revision currently stored (0 means "absent")
        got: u64,
    },

    /// Replay guard insert found an existing record
    #[error("signature already recorded")]
    DuplicateSignature,

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Io(_))
    }
}

impl From<cairn_proto::WireError> for StorageError {
    fn from(err: cairn_proto::WireError) -> Self {
        Self::Serialization(err.to_string())
    }
}
