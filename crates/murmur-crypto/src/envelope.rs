//! AES-256-GCM envelope for private keys at rest.
//!
//! The same envelope serves both custody modes. A passphrase envelope carries
//! its KDF parameters; a deployment envelope carries none, because its key is
//! derived once from the deployment secret.
//!
//! JSON form:
//!
//! ```text
//! { "version": 1, "iv": b64, "salt": b64?, "iterations": n?,
//!   "encryptedData": b64, "tag": b64 }
//! ```
//!
//! Decoding also accepts the older browser form: `encryptedPrivateKey` in
//! place of `encryptedData`, the tag appended to the ciphertext instead of a
//! separate field, and no `iterations` (meaning [`LEGACY_ITERATIONS`]).

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    encoding,
    error::CryptoError,
    kdf::{KdfParams, LEGACY_ITERATIONS, SALT_SIZE, SymmetricKey},
};

/// Envelope format version written by this crate.
pub const ENVELOPE_VERSION: u8 = 1;

/// AES-GCM IV size (96 bits).
pub const IV_SIZE: usize = 12;

/// AES-GCM tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Where the wrapping key of an envelope comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Derived from a user passphrase with these parameters.
    Passphrase(KdfParams),
    /// Derived from the deployment-wide custody secret.
    Deployment,
}

/// An encrypted private key.
///
/// The IV is fresh for every wrap. The tag is kept apart from the ciphertext
/// and verified on open; a mismatch fails closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WrappedKeyRepr", into = "WrappedKeyRepr")]
pub struct WrappedKey {
    source: KeySource,
    iv: [u8; IV_SIZE],
    ciphertext: Vec<u8>,
    tag: [u8; TAG_SIZE],
}

impl WrappedKey {
    /// Seal `plaintext` under `key` with the given IV.
    ///
    /// Pure: the caller provides the IV and must never reuse one with the same
    /// key.
    pub fn seal(
        key: &SymmetricKey,
        source: KeySource,
        iv: [u8; IV_SIZE],
        plaintext: &[u8],
    ) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new(key.as_bytes().into());

        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Wrap("AES-GCM encryption failed".to_string()))?;

        let split = sealed.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&sealed[split..]);
        sealed.truncate(split);

        Ok(Self { source, iv, ciphertext: sealed, tag })
    }

    /// Open the envelope with `key`, verifying the tag.
    ///
    /// # Errors
    ///
    /// - `Unwrap`: wrong key or tampered envelope (indistinguishable)
    pub fn open(&self, key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let cipher = Aes256Gcm::new(key.as_bytes().into());

        let mut sealed = Vec::with_capacity(self.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.tag);

        cipher
            .decrypt(Nonce::from_slice(&self.iv), sealed.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| {
                tracing::debug!("envelope tag verification failed");
                CryptoError::Unwrap
            })
    }

    /// Where this envelope's key comes from.
    pub fn source(&self) -> KeySource {
        self.source
    }

    /// KDF parameters, for passphrase envelopes.
    pub fn kdf_params(&self) -> Option<&KdfParams> {
        match &self.source {
            KeySource::Passphrase(params) => Some(params),
            KeySource::Deployment => None,
        }
    }

    /// The IV used for this wrap.
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Ciphertext without the tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// The GCM authentication tag.
    pub fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Serialize to the JSON envelope.
    pub fn to_json(&self) -> String {
        // Every field is a string or an integer; serialization cannot fail.
        let Ok(json) = serde_json::to_string(self) else {
            unreachable!("WrappedKey JSON serialization cannot fail");
        };
        json
    }

    /// Parse a JSON envelope, including the legacy browser forms.
    ///
    /// # Errors
    ///
    /// - `InvalidEnvelope`: malformed JSON, bad base64 or wrong field lengths
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(json).map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))
    }

    /// Flip one bit of the ciphertext or tag. Test helper for tamper checks.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn flip_bit(&mut self, bit: usize) {
        let total = (self.ciphertext.len() + TAG_SIZE) * 8;
        let bit = bit % total;
        let (byte, mask) = (bit / 8, 1u8 << (bit % 8));

        if byte < self.ciphertext.len() {
            self.ciphertext[byte] ^= mask;
        } else {
            self.tag[byte - self.ciphertext.len()] ^= mask;
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WrappedKeyRepr {
    #[serde(default = "default_version")]
    version: u8,
    iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
    #[serde(alias = "encryptedPrivateKey")]
    encrypted_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

fn default_version() -> u8 {
    ENVELOPE_VERSION
}

impl From<WrappedKey> for WrappedKeyRepr {
    fn from(key: WrappedKey) -> Self {
        let (salt, iterations) = match key.source {
            KeySource::Passphrase(params) => {
                (Some(encoding::encode(params.salt())), Some(params.iterations()))
            },
            KeySource::Deployment => (None, None),
        };

        Self {
            version: ENVELOPE_VERSION,
            iv: encoding::encode(&key.iv),
            salt,
            iterations,
            encrypted_data: encoding::encode(&key.ciphertext),
            tag: Some(encoding::encode(&key.tag)),
        }
    }
}

impl TryFrom<WrappedKeyRepr> for WrappedKey {
    type Error = CryptoError;

    fn try_from(repr: WrappedKeyRepr) -> Result<Self, Self::Error> {
        if repr.version != ENVELOPE_VERSION {
            return Err(CryptoError::InvalidEnvelope(format!(
                "unsupported version {}",
                repr.version
            )));
        }

        let iv: [u8; IV_SIZE] = decode_fixed(&repr.iv, "iv")?;

        let source = match (repr.salt, repr.iterations) {
            (Some(salt), iterations) => {
                let salt: [u8; SALT_SIZE] = decode_fixed(&salt, "salt")?;
                KdfParams::v1(iterations.unwrap_or(LEGACY_ITERATIONS), salt)
                    .map(KeySource::Passphrase)
                    .map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?
            },
            (None, None) => KeySource::Deployment,
            (None, Some(_)) => {
                return Err(CryptoError::InvalidEnvelope("iterations without salt".into()));
            },
        };

        let mut ciphertext = encoding::decode(&repr.encrypted_data)
            .ok_or_else(|| CryptoError::InvalidEnvelope("encryptedData is not base64".into()))?;

        let tag: [u8; TAG_SIZE] = match repr.tag {
            Some(tag) => decode_fixed(&tag, "tag")?,
            None => {
                // WebCrypto appends the tag to the ciphertext.
                if ciphertext.len() < TAG_SIZE {
                    return Err(CryptoError::InvalidEnvelope(
                        "encryptedData shorter than tag".into(),
                    ));
                }
                let split = ciphertext.len() - TAG_SIZE;
                let mut tag = [0u8; TAG_SIZE];
                tag.copy_from_slice(&ciphertext[split..]);
                ciphertext.truncate(split);
                tag
            },
        };

        Ok(Self { source, iv, ciphertext, tag })
    }
}

fn decode_fixed<const N: usize>(text: &str, field: &str) -> Result<[u8; N], CryptoError> {
    let bytes = encoding::decode(text)
        .ok_or_else(|| CryptoError::InvalidEnvelope(format!("{field} is not base64")))?;

    bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidEnvelope(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::MIN_ITERATIONS;

    fn test_key(byte: u8) -> SymmetricKey {
        SymmetricKey::from_bytes([byte; 32])
    }

    fn passphrase_source() -> KeySource {
        KeySource::Passphrase(KdfParams::v1(MIN_ITERATIONS, [9u8; SALT_SIZE]).unwrap())
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key(1);
        let wrapped = WrappedKey::seal(&key, passphrase_source(), [2u8; 12], b"secret").unwrap();

        assert_eq!(wrapped.ciphertext().len(), 6);
        assert_eq!(wrapped.open(&key).unwrap().as_slice(), b"secret");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let wrapped =
            WrappedKey::seal(&test_key(1), KeySource::Deployment, [2u8; 12], b"secret").unwrap();
        assert_eq!(wrapped.open(&test_key(2)), Err(CryptoError::Unwrap));
    }

    #[test]
    fn tampered_tag_fails_closed() {
        let key = test_key(1);
        let mut wrapped = WrappedKey::seal(&key, KeySource::Deployment, [2u8; 12], b"abc").unwrap();

        // Bits past the 3-byte ciphertext land in the tag.
        wrapped.flip_bit(3 * 8 + 5);
        assert_eq!(wrapped.open(&key), Err(CryptoError::Unwrap));
    }

    #[test]
    fn json_roundtrip_preserves_source() {
        let key = test_key(1);
        let wrapped = WrappedKey::seal(&key, passphrase_source(), [2u8; 12], b"secret").unwrap();

        let json = wrapped.to_json();
        assert!(json.contains("\"encryptedData\""));
        assert!(json.contains("\"iterations\":1000"));

        let parsed = WrappedKey::from_json(&json).unwrap();
        assert_eq!(parsed, wrapped);
    }

    #[test]
    fn deployment_envelope_has_no_salt() {
        let wrapped =
            WrappedKey::seal(&test_key(1), KeySource::Deployment, [2u8; 12], b"x").unwrap();
        let json = wrapped.to_json();

        assert!(!json.contains("salt"));
        assert!(!json.contains("iterations"));
        assert_eq!(WrappedKey::from_json(&json).unwrap().source(), KeySource::Deployment);
    }

    #[test]
    fn legacy_browser_envelope_decodes() {
        let key = test_key(4);
        let wrapped = WrappedKey::seal(&key, passphrase_source(), [5u8; 12], b"legacy").unwrap();

        let mut combined = wrapped.ciphertext().to_vec();
        combined.extend_from_slice(wrapped.tag());
        let legacy = format!(
            r#"{{"iv":"{}","salt":"{}","encryptedPrivateKey":"{}"}}"#,
            encoding::encode(wrapped.iv()),
            encoding::encode(&[9u8; SALT_SIZE]),
            encoding::encode(&combined),
        );

        let parsed = WrappedKey::from_json(&legacy).unwrap();
        assert_eq!(parsed.kdf_params().map(KdfParams::iterations), Some(LEGACY_ITERATIONS));
        assert_eq!(parsed.tag(), wrapped.tag());
        assert_eq!(parsed.open(&key).unwrap().as_slice(), b"legacy");
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let cases = [
            "not json",
            r#"{"iv":"AAAA","encryptedData":"AAAA","tag":"AAAA"}"#,
            r#"{"version":2,"iv":"AAAAAAAAAAAAAAAA","encryptedData":"AAAA"}"#,
            r#"{"iv":"AAAAAAAAAAAAAAAA","iterations":5000,"encryptedData":"AAAA"}"#,
            r#"{"iv":"AAAAAAAAAAAAAAAA","encryptedData":"AAAA"}"#,
        ];

        for case in cases {
            assert!(
                matches!(WrappedKey::from_json(case), Err(CryptoError::InvalidEnvelope(_))),
                "accepted: {case}"
            );
        }
    }
}
