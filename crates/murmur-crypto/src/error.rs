//! Error types for key custody and message encryption.
//!
//! Failures that could act as an oracle are deliberately coarse: unwrapping a
//! private key and decrypting a message each have exactly one failure variant,
//! whatever went wrong underneath. Callers see "cannot decrypt", never "wrong
//! passphrase" versus "corrupted data".

use thiserror::Error;

/// Errors produced by the cryptographic primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The CSPRNG or RSA prime search failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Sealing a private key into an envelope failed.
    #[error("key wrapping failed: {0}")]
    Wrap(String),

    /// The wrapped key could not be opened.
    ///
    /// Covers wrong passphrase, wrong deployment secret, tampered ciphertext or
    /// tag, and envelopes whose plaintext is not a private key.
    #[error("cannot decrypt private key")]
    Unwrap,

    /// Message encryption was refused.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// The message could not be decrypted with this key.
    #[error("unable to read this message")]
    Decryption,

    /// DER or base64 key material could not be parsed.
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// The wrapped-key envelope is structurally invalid (bad JSON, wrong field
    /// lengths, unknown version).
    #[error("invalid key envelope: {0}")]
    InvalidEnvelope(String),

    /// The deployment secret is not 32 bytes of hex.
    #[error("invalid deployment secret: {0}")]
    InvalidSecret(String),

    /// KDF parameters outside the accepted range.
    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParams(String),
}

/// Reasons an encryption request is refused before any ciphertext exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    /// Plaintext exceeds what one RSA-OAEP block can carry.
    #[error("message too large: {len} bytes, limit is {max}")]
    MessageTooLarge {
        /// Plaintext length in bytes
        len: usize,
        /// Maximum plaintext length for the recipient key
        max: usize,
    },

    /// The recipient's public key cannot be imported.
    #[error("recipient public key is invalid")]
    InvalidRecipientKey,
}

impl CryptoError {
    /// Returns true if the caller can fix the request and try again.
    ///
    /// Oversized messages and malformed inputs are caller errors. Unwrap and
    /// decryption failures are not: retrying the same input fails the same way.
    pub fn is_caller_correctable(&self) -> bool {
        matches!(
            self,
            Self::Encryption(_)
                | Self::InvalidKeyEncoding(_)
                | Self::InvalidEnvelope(_)
                | Self::InvalidSecret(_)
                | Self::InvalidKdfParams(_)
        )
    }
}
