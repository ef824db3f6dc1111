//! Postmaster error types.
//!
//! Business outcomes are not errors: a moderation rejection is a
//! [`Delivery::Rejected`](crate::Delivery::Rejected) value. Everything here is
//! a request the service could not carry out.

use murmur_core::{IdentityError, IdentityId, MessageError};
use murmur_crypto::CryptoError;
use thiserror::Error;

use crate::{directory::DirectoryError, storage::StorageError};

/// Errors from [`Postmaster`](crate::Postmaster) operations.
#[derive(Error, Debug)]
pub enum PostmasterError {
    /// Username fails the naming rules.
    ///
    /// Fatal for the request - caller must pick another name.
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    /// Server custody requested but no deployment secret is configured.
    #[error("server key custody is not configured")]
    CustodyDisabled,

    /// Identity exists but holds no active key.
    ///
    /// Should never happen: registration and rotation always leave exactly
    /// one active generation. Indicates corrupted storage.
    #[error("identity {0} has no active key")]
    NoActiveKey(IdentityId),

    /// The active key is client-custodied; the server holds no copy.
    #[error("identity {0} keeps its private key on the client")]
    NotCustodied(IdentityId),

    /// The active key is the last representable generation.
    #[error("identity {0} has no key generations left")]
    GenerationsExhausted(IdentityId),

    /// No identity with this ID.
    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityId),

    /// Submitted ciphertext is malformed.
    ///
    /// Fatal for the request - the sender must re-encrypt.
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),

    /// Key generation, wrapping or unwrapping failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Recipient lookup failed.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Storage backend failed.
    ///
    /// May be transient (I/O) or a lost race (`Conflict`); see
    /// [`StorageError::is_conflict`].
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A blocking worker panicked or was cancelled.
    #[error("worker failed: {0}")]
    Worker(String),
}

impl From<IdentityError> for PostmasterError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidUsername(reason) => Self::InvalidUsername(reason),
            other => Self::Storage(StorageError::Serialization(other.to_string())),
        }
    }
}

impl From<tokio::task::JoinError> for PostmasterError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}

impl PostmasterError {
    /// Returns true if the caller can fix the request and try again.
    pub fn is_caller_correctable(&self) -> bool {
        match self {
            Self::InvalidUsername(_) | Self::Message(_) => true,
            Self::Crypto(err) => err.is_caller_correctable(),
            Self::Directory(DirectoryError::NotFound(_)) => true,
            Self::Storage(StorageError::UsernameTaken(_)) => true,
            _ => false,
        }
    }
}
