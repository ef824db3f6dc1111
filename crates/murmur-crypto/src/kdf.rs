//! Password-based key derivation (PBKDF2-HMAC-SHA256).
//!
//! Every passphrase-wrapped envelope records the parameters it was sealed
//! with, so the iteration count can be raised for new wraps without breaking
//! old ones.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Iteration count for new passphrase wraps.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Iteration count assumed for envelopes that predate stored parameters.
pub const LEGACY_ITERATIONS: u32 = 100_000;

/// Lowest iteration count accepted.
pub const MIN_ITERATIONS: u32 = 1_000;

/// Highest iteration count accepted. Bounds the work a tampered envelope can
/// demand.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Salt length in bytes.
pub const SALT_SIZE: usize = 16;

/// Derived key length in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// Versioned KDF parameters stored alongside a wrapped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfParams {
    /// PBKDF2-HMAC-SHA256 with a 256-bit output.
    V1 {
        /// PBKDF2 iteration count
        iterations: u32,
        /// Random per-wrap salt
        salt: [u8; SALT_SIZE],
    },
}

impl KdfParams {
    /// Version 1 parameters, validated.
    pub fn v1(iterations: u32, salt: [u8; SALT_SIZE]) -> Result<Self, CryptoError> {
        check_iterations(iterations)?;
        Ok(Self::V1 { iterations, salt })
    }

    /// Iteration count.
    pub fn iterations(&self) -> u32 {
        match self {
            Self::V1 { iterations, .. } => *iterations,
        }
    }

    /// Salt bytes.
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        match self {
            Self::V1 { salt, .. } => salt,
        }
    }

    /// Derive the wrapping key for `secret` under these parameters.
    pub fn derive(&self, secret: &[u8]) -> Result<SymmetricKey, CryptoError> {
        match self {
            Self::V1 { iterations, salt } => derive(secret, salt, *iterations),
        }
    }
}

/// A 256-bit symmetric key, zeroed on drop.
#[derive(Clone)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Derive a 256-bit key from `secret` with PBKDF2-HMAC-SHA256.
///
/// CPU cost is linear in `iterations`; async callers should run this on a
/// blocking thread.
///
/// # Errors
///
/// - `InvalidKdfParams`: `iterations` outside
///   [`MIN_ITERATIONS`]..=[`MAX_ITERATIONS`]
pub fn derive(secret: &[u8], salt: &[u8], iterations: u32) -> Result<SymmetricKey, CryptoError> {
    check_iterations(iterations)?;

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key);
    let derived = SymmetricKey(key);
    key.zeroize();

    Ok(derived)
}

fn check_iterations(iterations: u32) -> Result<(), CryptoError> {
    if (MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
        Ok(())
    } else {
        Err(CryptoError::InvalidKdfParams(format!(
            "iterations must be between {MIN_ITERATIONS} and {MAX_ITERATIONS}, got {iterations}"
        )))
    }
}
