//! Public key directory.
//!
//! Resolves usernames to the active public key of their identity, and
//! `(identity, generation)` pairs to historical keys. Reads go straight to
//! storage on every call; a rotated key is visible to the next lookup.

use murmur_core::{IdentityId, identity::normalize_username};
use murmur_crypto::{CryptoError, PublicKey};
use thiserror::Error;

use crate::storage::{Storage, StorageError};

/// Errors from directory lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// No identity or key matches the query
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored public key does not parse
    #[error("stored public key is unusable: {0}")]
    CorruptKey(#[from] CryptoError),

    /// Storage backend failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// The published key of an identity.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Owning identity
    pub identity_id: IdentityId,
    /// Key generation of `public_key`
    pub generation: u32,
    /// RSA public key
    pub public_key: PublicKey,
    /// Hex SHA-256 of the SPKI DER, for out-of-band comparison
    pub fingerprint: String,
}

/// Read-only view over identity key records.
#[derive(Clone)]
pub struct PublicKeyDirectory<S: Storage> {
    storage: S,
}

impl<S: Storage> PublicKeyDirectory<S> {
    /// Directory over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Active key of `username`.
    ///
    /// The username is normalized first, so `" Alice "` finds `alice`.
    ///
    /// # Errors
    ///
    /// - `NotFound`: invalid or unknown username, or no active key
    /// - `CorruptKey`: the stored key does not decode
    /// - `Storage`: backend failure
    pub fn lookup(&self, username: &str) -> Result<DirectoryEntry, DirectoryError> {
        let name = normalize_username(username)
            .map_err(|_| DirectoryError::NotFound(username.trim().to_string()))?;

        let identity =
            self.storage.find_identity(&name)?.ok_or_else(|| DirectoryError::NotFound(name))?;

        let record = self
            .storage
            .active_key(identity.id)?
            .ok_or_else(|| DirectoryError::NotFound(format!("active key of {}", identity.id)))?;

        Self::entry(identity.id, record.generation, &record.public_key_der)
    }

    /// Key generation `generation` of `identity`, active or superseded.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such identity or generation
    /// - `CorruptKey`: the stored key does not decode
    /// - `Storage`: backend failure
    pub fn key_at(
        &self,
        identity: IdentityId,
        generation: u32,
    ) -> Result<DirectoryEntry, DirectoryError> {
        let record = self.storage.load_key(identity, generation)?.ok_or_else(|| {
            DirectoryError::NotFound(format!("generation {generation} of {identity}"))
        })?;

        Self::entry(identity, record.generation, &record.public_key_der)
    }

    fn entry(
        identity_id: IdentityId,
        generation: u32,
        der: &[u8],
    ) -> Result<DirectoryEntry, DirectoryError> {
        let public_key = PublicKey::from_der(der)?;
        let fingerprint = public_key.fingerprint();

        Ok(DirectoryEntry { identity_id, generation, public_key, fingerprint })
    }
}
