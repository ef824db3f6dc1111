//! Identities and their key records.
//!
//! An identity owns a sequence of key generations. Exactly one generation is
//! active at a time; rotation marks the previous one superseded instead of
//! overwriting it, so messages encrypted to old keys stay attributable.

use std::fmt;

use murmur_crypto::{CryptoError, PublicKey, WrappedKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest accepted username.
pub const MIN_USERNAME_LEN: usize = 3;

/// Longest accepted username.
pub const MAX_USERNAME_LEN: usize = 32;

/// Stable identifier of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub u64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Errors from identity and key-record validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Username fails the naming rules
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    /// Rotation attempted on a record that is no longer active
    #[error("key generation {generation} is already superseded")]
    AlreadySuperseded {
        /// Generation of the stale record
        generation: u32,
    },

    /// New generation does not directly follow the active one
    #[error("key generation must be {expected}, got {got}")]
    GenerationGap {
        /// Next valid generation (past `u32::MAX` when generations are
        /// exhausted)
        expected: u64,
        /// Generation supplied
        got: u32,
    },
}

/// A registered identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identifier
    pub id: IdentityId,
    /// Normalized unique username
    pub username: String,
    /// Free-form display name
    pub display_name: String,
    /// Unix timestamp (seconds) of registration
    pub created_at_secs: u64,
}

/// Normalize a username: trim, lowercase, then check length and alphabet.
///
/// # Errors
///
/// - `InvalidUsername`: shorter than 3, longer than 32, or characters outside
///   `[a-z0-9_.-]`
pub fn normalize_username(raw: &str) -> Result<String, IdentityError> {
    let name = raw.trim().to_lowercase();
    let len = name.chars().count();

    if len < MIN_USERNAME_LEN {
        return Err(IdentityError::InvalidUsername(format!(
            "must be at least {MIN_USERNAME_LEN} characters"
        )));
    }
    if len > MAX_USERNAME_LEN {
        return Err(IdentityError::InvalidUsername(format!(
            "must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    if let Some(bad) =
        name.chars().find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(*c)))
    {
        return Err(IdentityError::InvalidUsername(format!("character {bad:?} is not allowed")));
    }

    Ok(name)
}

/// Who holds the private key of a key generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Custody {
    /// The client keeps the passphrase-wrapped key; the server holds no copy.
    Client,
    /// The server keeps the key wrapped under the deployment secret.
    Server(WrappedKey),
}

/// Lifecycle state of a key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Current key; new messages are encrypted to it.
    Active,
    /// Replaced by a newer generation.
    Superseded {
        /// Unix timestamp (seconds) of the rotation
        at_secs: u64,
        /// Generation that replaced this one
        by_generation: u32,
    },
}

/// One key generation of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Owning identity
    pub identity_id: IdentityId,
    /// 0 for the first key, +1 per rotation
    pub generation: u32,
    /// SPKI DER public key
    pub public_key_der: Vec<u8>,
    /// Private key custody
    pub custody: Custody,
    /// Active or superseded
    pub status: KeyStatus,
    /// Unix timestamp (seconds) of creation
    pub created_at_secs: u64,
}

impl KeyRecord {
    /// A new active record.
    pub fn active(
        identity_id: IdentityId,
        generation: u32,
        public_key: &PublicKey,
        custody: Custody,
        created_at_secs: u64,
    ) -> Self {
        Self {
            identity_id,
            generation,
            public_key_der: public_key.to_der(),
            custody,
            status: KeyStatus::Active,
            created_at_secs,
        }
    }

    /// Whether new messages may be encrypted to this record.
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    /// Parse the stored public key.
    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_der(&self.public_key_der)
    }

    /// Transition `Active -> Superseded` in favour of `next`.
    ///
    /// # Errors
    ///
    /// - `AlreadySuperseded`: this record is not active
    /// - `GenerationGap`: `next` is not `self.generation + 1`
    pub fn supersede(&mut self, next: &KeyRecord, at_secs: u64) -> Result<(), IdentityError> {
        if !self.is_active() {
            return Err(IdentityError::AlreadySuperseded { generation: self.generation });
        }

        let expected = u64::from(self.generation) + 1;
        if u64::from(next.generation) != expected {
            return Err(IdentityError::GenerationGap { expected, got: next.generation });
        }

        self.status = KeyStatus::Superseded { at_secs, by_generation: next.generation };
        Ok(())
    }
}
