//! RSA key pair generation and key encodings.
//!
//! Public keys travel as SPKI DER (base64 on the wire). Private keys leave this
//! module only as PKCS#8 DER inside zeroizing buffers, and normally only on
//! their way into a [`WrappedKey`](crate::WrappedKey).

use std::fmt;

use rand::{CryptoRng, RngCore};
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{encoding, error::CryptoError};

/// Default modulus size for new key pairs.
pub const DEFAULT_MODULUS_BITS: usize = 2048;

/// Smallest modulus accepted for generation or import.
pub const MIN_MODULUS_BITS: usize = 2048;

/// Largest modulus accepted for generation.
pub const MAX_MODULUS_BITS: usize = 4096;

/// Public exponent of every generated key.
pub const PUBLIC_EXPONENT: u32 = 65_537;

/// A recipient's RSA public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Import an SPKI DER public key.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyEncoding`: not SPKI DER, or modulus below
    ///   [`MIN_MODULUS_BITS`]
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;

        let bits = key.n().bits();
        if bits < MIN_MODULUS_BITS {
            return Err(CryptoError::InvalidKeyEncoding(format!(
                "modulus is {bits} bits, minimum is {MIN_MODULUS_BITS}"
            )));
        }

        Ok(Self(key))
    }

    /// Import a base64 SPKI public key. PEM armor is accepted.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let der = encoding::decode(text)
            .ok_or_else(|| CryptoError::InvalidKeyEncoding("public key is not base64".into()))?;
        Self::from_der(&der)
    }

    /// SPKI DER encoding.
    pub fn to_der(&self) -> Vec<u8> {
        // Encoding a key that was parsed or generated successfully cannot fail.
        let Ok(doc) = self.0.to_public_key_der() else {
            unreachable!("SPKI encoding of a valid RSA public key cannot fail");
        };
        doc.as_bytes().to_vec()
    }

    /// Base64 SPKI encoding, the form published by the directory.
    pub fn to_base64(&self) -> String {
        encoding::encode(&self.to_der())
    }

    /// Modulus size in bytes. Every ciphertext for this key has this length.
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Modulus size in bits.
    pub fn modulus_bits(&self) -> usize {
        self.0.n().bits()
    }

    /// Hex SHA-256 over the SPKI DER.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.to_der()))
    }

    pub(crate) fn as_rsa(&self) -> &RsaPublicKey {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("bits", &self.modulus_bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// An RSA private key.
///
/// `Debug` never prints key material.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(RsaPrivateKey);

impl PrivateKey {
    /// Import a PKCS#8 DER private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        RsaPrivateKey::from_pkcs8_der(der)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))
    }

    /// PKCS#8 DER encoding in a buffer that is zeroed on drop.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = self.0.to_pkcs8_der().map_err(|e| CryptoError::Wrap(e.to_string()))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(RsaPublicKey::from(&self.0))
    }

    pub(crate) fn as_rsa(&self) -> &RsaPrivateKey {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey").field("bits", &(self.0.size() * 8)).finish_non_exhaustive()
    }
}

/// A matched public/private key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Public half, safe to publish
    pub public: PublicKey,
    /// Private half, must be wrapped before it is stored anywhere
    pub private: PrivateKey,
}

/// Generate an RSA key pair with public exponent 65537.
///
/// The caller supplies the CSPRNG so tests can use a seeded generator.
/// Generation of a 2048-bit key is CPU-heavy; async callers should run it on a
/// blocking thread.
///
/// # Errors
///
/// - `KeyGeneration`: `bits` outside
///   [`MIN_MODULUS_BITS`]..=[`MAX_MODULUS_BITS`], or the prime search failed
pub fn generate_keypair<R>(rng: &mut R, bits: usize) -> Result<KeyPair, CryptoError>
where
    R: RngCore + CryptoRng,
{
    if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&bits) {
        return Err(CryptoError::KeyGeneration(format!(
            "modulus must be between {MIN_MODULUS_BITS} and {MAX_MODULUS_BITS} bits, got {bits}"
        )));
    }

    let exponent = BigUint::from(PUBLIC_EXPONENT);
    let private = RsaPrivateKey::new_with_exp(rng, bits, &exponent)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    debug_assert_eq!(private.e(), &exponent);
    debug_assert_eq!(private.size() * 8, bits);

    let public = PublicKey(RsaPublicKey::from(&private));
    Ok(KeyPair { public, private: PrivateKey(private) })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn test_keypair(seed: u64) -> KeyPair {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        generate_keypair(&mut rng, DEFAULT_MODULUS_BITS).unwrap()
    }

    #[test]
    fn generated_key_has_requested_shape() {
        let pair = test_keypair(1);

        assert_eq!(pair.public.modulus_bits(), 2048);
        assert_eq!(pair.public.size(), 256);
        assert_eq!(pair.public.as_rsa().e(), &BigUint::from(PUBLIC_EXPONENT));
        assert_eq!(pair.private.public_key(), pair.public);
    }

    #[test]
    fn rejects_weak_modulus() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let result = generate_keypair(&mut rng, 1024);
        assert!(matches!(result, Err(CryptoError::KeyGeneration(_))));
    }

    #[test]
    fn rejects_modulus_one_bit_short() {
        // 2047 bits still fills 256 bytes.
        let n = (BigUint::from(1u8) << 2046usize) + BigUint::from(1u8);
        let short = RsaPublicKey::new(n, BigUint::from(PUBLIC_EXPONENT)).unwrap();
        assert_eq!(short.size(), 256);

        let der = short.to_public_key_der().unwrap();
        let result = PublicKey::from_der(der.as_bytes());
        assert!(matches!(result, Err(CryptoError::InvalidKeyEncoding(_))));
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let pair = test_keypair(3);

        let encoded = pair.public.to_base64();
        let decoded = PublicKey::from_base64(&encoded).unwrap();

        assert_eq!(decoded, pair.public);
        assert_eq!(decoded.fingerprint(), pair.public.fingerprint());
    }

    #[test]
    fn public_key_accepts_pem_armor() {
        let pair = test_keypair(4);
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            pair.public.to_base64()
        );

        assert_eq!(PublicKey::from_base64(&pem).unwrap(), pair.public);
    }

    #[test]
    fn private_key_pkcs8_roundtrip() {
        let pair = test_keypair(5);

        let der = pair.private.to_pkcs8_der().unwrap();
        let restored = PrivateKey::from_pkcs8_der(&der).unwrap();

        assert_eq!(restored, pair.private);
    }

    #[test]
    fn garbage_public_key_is_rejected() {
        let result = PublicKey::from_der(&[0x30, 0x03, 0x02, 0x01, 0x01]);
        assert!(matches!(result, Err(CryptoError::InvalidKeyEncoding(_))));
        assert!(PublicKey::from_base64("!!!").is_err());
    }

    #[test]
    fn debug_output_hides_private_material() {
        let pair = test_keypair(6);
        let rendered = format!("{:?}", pair.private);
        assert_eq!(rendered, "PrivateKey { bits: 2048, .. }");
    }
}
