//! Client-side key store.
//!
//! Keeps the passphrase-wrapped private keys of client-custodied identities,
//! one JSON file per username. Files hold envelopes only; without the
//! passphrase they reveal nothing but KDF parameters.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use murmur_core::{IdentityId, Keyring};
use murmur_crypto::{CryptoError, PrivateKeyVault, WrappedKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the key store.
#[derive(Error, Debug)]
pub enum KeyStoreError {
    /// Filesystem failure
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A key file is not valid JSON
    #[error("key file {path} is corrupt: {reason}")]
    Corrupt {
        /// File that failed to parse
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// No keys saved for this username
    #[error("no keys stored for {0}")]
    NotFound(String),

    /// Stored keys belong to a different identity
    #[error("key file for {username} belongs to identity {stored}, not {requested}")]
    IdentityMismatch {
        /// Username of the file
        username: String,
        /// Identity recorded in the file
        stored: IdentityId,
        /// Identity the caller tried to save for
        requested: IdentityId,
    },

    /// An envelope did not open with the passphrase
    #[error("unlock failed: {0}")]
    Unlock(#[from] CryptoError),
}

/// Everything stored for one username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeys {
    /// Owning identity
    pub identity_id: IdentityId,
    /// Envelopes by key generation
    pub keys: BTreeMap<u32, WrappedKey>,
}

/// Directory of per-username key files.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    root: PathBuf,
}

impl FileKeyStore {
    /// Open (creating if needed) a key store at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Add the envelope of `generation` for `username`.
    ///
    /// Replaces an existing envelope for the same generation. The file is
    /// written to a temporary path and renamed into place.
    pub fn save(
        &self,
        username: &str,
        identity_id: IdentityId,
        generation: u32,
        wrapped: &WrappedKey,
    ) -> Result<(), KeyStoreError> {
        let mut stored = match self.load(username)? {
            Some(existing) if existing.identity_id != identity_id => {
                return Err(KeyStoreError::IdentityMismatch {
                    username: username.to_string(),
                    stored: existing.identity_id,
                    requested: identity_id,
                });
            },
            Some(existing) => existing,
            None => StoredKeys { identity_id, keys: BTreeMap::new() },
        };
        stored.keys.insert(generation, wrapped.clone());

        let path = self.path(username);
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| KeyStoreError::Corrupt { path: path.clone(), reason: e.to_string() })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        tracing::debug!(username, generation, "wrapped key saved");
        Ok(())
    }

    /// Stored keys for `username`, if any.
    pub fn load(&self, username: &str) -> Result<Option<StoredKeys>, KeyStoreError> {
        let path = self.path(username);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| KeyStoreError::Corrupt { path, reason: e.to_string() })
    }

    /// Unwrap the stored generations of `username` that open with `passphrase`.
    ///
    /// Generations may be wrapped under different passphrases after a
    /// rotation. Envelopes that do not open are left out of the keyring, so
    /// messages for them surface as `KeyUnavailable` when opened.
    ///
    /// # Errors
    ///
    /// - `NotFound`: nothing stored for `username`
    /// - `Unlock`: no envelope opens with `passphrase`
    pub fn unlock(
        &self,
        username: &str,
        passphrase: &str,
    ) -> Result<(IdentityId, Keyring), KeyStoreError> {
        let stored = self.load(username)?.ok_or_else(|| KeyStoreError::NotFound(username.into()))?;
        let vault = PrivateKeyVault::new();

        let mut keyring = Keyring::new();
        let mut locked = Vec::new();
        for (generation, wrapped) in &stored.keys {
            match vault.unwrap(wrapped, passphrase) {
                Ok(key) => keyring.insert(*generation, key),
                Err(_) => locked.push(*generation),
            }
        }

        if keyring.is_empty() {
            return Err(KeyStoreError::Unlock(CryptoError::Unwrap));
        }
        if !locked.is_empty() {
            tracing::debug!(username, ?locked, "some generations did not open");
        }

        Ok((stored.identity_id, keyring))
    }

    fn path(&self, username: &str) -> PathBuf {
        self.root.join(format!("{username}.json"))
    }
}

#[cfg(test)]
mod tests {
    use murmur_crypto::{generate_keypair, kdf::MIN_ITERATIONS};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use tempfile::tempdir;

    use super::*;

    fn wrapped(seed: u64, passphrase: &str) -> WrappedKey {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let pair = generate_keypair(&mut rng, 2048).unwrap();
        PrivateKeyVault::with_iterations(MIN_ITERATIONS)
            .unwrap()
            .wrap(&pair.private, passphrase, &mut rng)
            .unwrap()
    }

    #[test]
    fn save_then_unlock() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();

        store.save("alice", IdentityId(3), 0, &wrapped(1, "p1")).unwrap();
        store.save("alice", IdentityId(3), 1, &wrapped(2, "p1")).unwrap();

        let (id, keyring) = store.unlock("alice", "p1").unwrap();
        assert_eq!(id, IdentityId(3));
        assert_eq!(keyring.len(), 2);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        store.save("alice", IdentityId(3), 0, &wrapped(1, "p1")).unwrap();

        let result = store.unlock("alice", "p2");
        assert!(matches!(result, Err(KeyStoreError::Unlock(CryptoError::Unwrap))));
    }

    #[test]
    fn mixed_passphrases_unlock_what_they_can() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        store.save("alice", IdentityId(3), 0, &wrapped(1, "old")).unwrap();
        store.save("alice", IdentityId(3), 1, &wrapped(2, "new")).unwrap();

        let (_, with_new) = store.unlock("alice", "new").unwrap();
        assert_eq!(with_new.len(), 1);
        assert!(with_new.get(1).is_some());

        let (_, with_old) = store.unlock("alice", "old").unwrap();
        assert_eq!(with_old.len(), 1);
        assert!(with_old.get(0).is_some());

        assert!(matches!(
            store.unlock("alice", "neither"),
            Err(KeyStoreError::Unlock(CryptoError::Unwrap))
        ));
    }

    #[test]
    fn missing_user_is_none() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();

        assert!(store.load("nobody").unwrap().is_none());
        assert!(matches!(store.unlock("nobody", "x"), Err(KeyStoreError::NotFound(_))));
    }

    #[test]
    fn refuses_identity_mismatch() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        let key = wrapped(1, "p1");
        store.save("alice", IdentityId(3), 0, &key).unwrap();

        let result = store.save("alice", IdentityId(4), 1, &key);
        assert!(matches!(result, Err(KeyStoreError::IdentityMismatch { .. })));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("alice.json"), b"{not json").unwrap();

        assert!(matches!(store.load("alice"), Err(KeyStoreError::Corrupt { .. })));
    }
}
