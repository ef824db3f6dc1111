//! Encrypted message records and submission validation.

use murmur_crypto::encoding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityId;

/// Errors from validating an inbound submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Ciphertext is not base64
    #[error("ciphertext is not valid base64")]
    MalformedCiphertext,

    /// Ciphertext length does not match the recipient's modulus
    #[error("ciphertext must be {expected} bytes, got {got}")]
    CiphertextLength {
        /// Recipient modulus size in bytes
        expected: usize,
        /// Decoded ciphertext length
        got: usize,
    },
}

/// A message as persisted: ciphertext plus routing metadata.
///
/// Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Recipient identity
    pub recipient: IdentityId,
    /// Authenticated sender, or `None` for anonymous messages
    pub sender: Option<IdentityId>,
    /// Key generation the ciphertext was encrypted to
    pub key_generation: u32,
    /// RSA-OAEP ciphertext
    pub ciphertext: Vec<u8>,
    /// Unix timestamp (seconds) of acceptance
    pub created_at_secs: u64,
}

impl EncryptedMessage {
    /// Ciphertext as base64, the wire form.
    pub fn ciphertext_base64(&self) -> String {
        encoding::encode(&self.ciphertext)
    }
}

/// Address of a stored message: recipient plus position in their log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Recipient identity
    pub recipient: IdentityId,
    /// Index in the recipient's append-only log
    pub index: u64,
}

/// A message together with its log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Where the message lives
    pub id: MessageId,
    /// The message itself
    pub message: EncryptedMessage,
}

/// An inbound message awaiting validation and moderation.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Recipient username
    pub recipient: String,
    /// Base64 RSA-OAEP ciphertext
    pub ciphertext: String,
    /// Key generation the sender encrypted to, as published by the directory
    ///
    /// May lag behind the active generation if the recipient rotated after
    /// the sender fetched the key.
    pub key_generation: u32,
    /// Plaintext offered for screening, if the sender supplied it
    ///
    /// Never persisted. When absent the moderation gate cannot classify the
    /// message and the failure policy decides.
    pub screening_text: Option<String>,
    /// Authenticated sender, if any
    pub sender: Option<IdentityId>,
}

/// Decode a base64 ciphertext and check it is exactly one RSA block.
///
/// # Errors
///
/// - `MalformedCiphertext`: not base64
/// - `CiphertextLength`: decoded length differs from `modulus_size`
pub fn decode_ciphertext(text: &str, modulus_size: usize) -> Result<Vec<u8>, MessageError> {
    let bytes = encoding::decode(text).ok_or(MessageError::MalformedCiphertext)?;

    if bytes.len() != modulus_size {
        return Err(MessageError::CiphertextLength { expected: modulus_size, got: bytes.len() });
    }

    Ok(bytes)
}
