//! RSA-OAEP message encryption (SHA-256 digest, SHA-256 MGF1).
//!
//! A message is a single OAEP block, so its plaintext is bounded by
//! `k - 2*32 - 2` bytes for a `k`-byte modulus: 190 bytes for 2048-bit keys.
//! The limit is checked before any RSA work.

use rand::{CryptoRng, RngCore, rngs::OsRng};
use rsa::Oaep;
use sha2::Sha256;

use crate::{
    encoding,
    error::{CryptoError, EncryptionError},
    keypair::{PrivateKey, PublicKey},
};

/// SHA-256 output size, used twice by OAEP.
const HASH_SIZE: usize = 32;

/// Largest plaintext `key` can encrypt in one block.
pub fn max_plaintext_len(key: &PublicKey) -> usize {
    key.size().saturating_sub(2 * HASH_SIZE + 2)
}

/// Encrypt `plaintext` to `recipient`.
///
/// # Errors
///
/// - `Encryption(MessageTooLarge)`: plaintext over [`max_plaintext_len`]
pub fn encrypt<R>(plaintext: &[u8], recipient: &PublicKey, rng: &mut R) -> Result<Vec<u8>, CryptoError>
where
    R: RngCore + CryptoRng,
{
    let max = max_plaintext_len(recipient);
    if plaintext.len() > max {
        return Err(EncryptionError::MessageTooLarge { len: plaintext.len(), max }.into());
    }

    let ciphertext = recipient
        .as_rsa()
        .encrypt(rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| {
            tracing::debug!(error = %e, "RSA-OAEP encryption failed");
            CryptoError::from(EncryptionError::InvalidRecipientKey)
        })?;

    debug_assert_eq!(ciphertext.len(), recipient.size());
    Ok(ciphertext)
}

/// Encrypt to a base64 SPKI key and return base64 ciphertext.
///
/// This is the sender-side path: the key comes straight from the directory.
///
/// # Errors
///
/// - `Encryption(InvalidRecipientKey)`: the key cannot be imported
/// - `Encryption(MessageTooLarge)`: plaintext over the limit
pub fn encrypt_to_encoded<R>(
    plaintext: &[u8],
    recipient_b64: &str,
    rng: &mut R,
) -> Result<String, CryptoError>
where
    R: RngCore + CryptoRng,
{
    let recipient = PublicKey::from_base64(recipient_b64)
        .map_err(|_| CryptoError::from(EncryptionError::InvalidRecipientKey))?;

    encrypt(plaintext, &recipient, rng).map(|ct| encoding::encode(&ct))
}

/// Decrypt a ciphertext with the recipient's private key.
///
/// Uses blinded RSA decryption.
///
/// # Errors
///
/// - `Decryption`: for every failure (wrong key, tampering, bad length)
pub fn decrypt(ciphertext: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>, CryptoError> {
    private_key.as_rsa().decrypt_blinded(&mut OsRng, Oaep::new::<Sha256>(), ciphertext).map_err(
        |e| {
            tracing::debug!(error = %e, "RSA-OAEP decryption failed");
            CryptoError::Decryption
        },
    )
}

/// Decrypt a base64 ciphertext into UTF-8 text.
///
/// # Errors
///
/// - `Decryption`: not base64, not decryptable, or not UTF-8
pub fn decrypt_text(ciphertext_b64: &str, private_key: &PrivateKey) -> Result<String, CryptoError> {
    let ciphertext = encoding::decode(ciphertext_b64).ok_or(CryptoError::Decryption)?;
    let plaintext = decrypt(&ciphertext, private_key)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::keypair::{DEFAULT_MODULUS_BITS, KeyPair, generate_keypair};

    fn fixture(seed: u64) -> (KeyPair, ChaCha20Rng) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let pair = generate_keypair(&mut rng, DEFAULT_MODULUS_BITS).unwrap();
        (pair, rng)
    }

    #[test]
    fn limit_for_2048_bit_key_is_190() {
        let (pair, _) = fixture(1);
        assert_eq!(max_plaintext_len(&pair.public), 190);
    }

    #[test]
    fn roundtrip_text() {
        let (pair, mut rng) = fixture(2);

        let encoded = encrypt_to_encoded(b"hello", &pair.public.to_base64(), &mut rng).unwrap();
        assert_eq!(decrypt_text(&encoded, &pair.private).unwrap(), "hello");
    }

    #[test]
    fn ciphertext_length_equals_modulus() {
        let (pair, mut rng) = fixture(3);
        let ct = encrypt(b"", &pair.public, &mut rng).unwrap();
        assert_eq!(ct.len(), 256);
    }

    #[test]
    fn oversize_plaintext_is_rejected() {
        let (pair, mut rng) = fixture(4);
        let result = encrypt(&[b'a'; 191], &pair.public, &mut rng);

        assert_eq!(
            result,
            Err(CryptoError::Encryption(EncryptionError::MessageTooLarge { len: 191, max: 190 }))
        );
    }

    #[test]
    fn invalid_recipient_key_is_reported() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let result = encrypt_to_encoded(b"hi", "bm90IGEga2V5", &mut rng);

        assert_eq!(result, Err(CryptoError::Encryption(EncryptionError::InvalidRecipientKey)));
    }

    #[test]
    fn wrong_key_cannot_read() {
        let (alice, mut rng) = fixture(6);
        let (mallory, _) = fixture(7);

        let ct = encrypt(b"for alice", &alice.public, &mut rng).unwrap();
        assert_eq!(decrypt(&ct, &mallory.private), Err(CryptoError::Decryption));
    }

    #[test]
    fn garbage_base64_is_decryption_failure() {
        let (pair, _) = fixture(8);
        assert_eq!(decrypt_text("@@@", &pair.private), Err(CryptoError::Decryption));
    }
}
