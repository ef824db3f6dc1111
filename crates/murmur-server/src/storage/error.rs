use murmur_core::IdentityId;
use thiserror::Error;

/// Errors returned by [`Storage`](super::Storage) implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Underlying database or filesystem failure
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Log index or key generation does not follow the stored state
    #[error("conflict: expected {expected}, got {got}")]
    Conflict {
        /// Next valid index or generation
        expected: u64,
        /// Index or generation supplied
        got: u64,
    },

    /// Another identity already uses this username
    #[error("username already taken: {0}")]
    UsernameTaken(String),

    /// No identity with this ID
    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityId),
}

impl StorageError {
    /// Returns true if re-reading state and retrying may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
