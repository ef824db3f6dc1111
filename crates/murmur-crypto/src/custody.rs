//! Server-side custody of private keys under a deployment secret.
//!
//! # Trust boundary
//!
//! Anyone who holds both the deployment secret and the stored envelopes can
//! recover every server-custodied private key. Server custody protects keys
//! against a leaked database, not against the operator. Users who need the
//! stronger guarantee should choose client custody
//! ([`PrivateKeyVault`](crate::PrivateKeyVault)).

use std::fmt;

use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::{
    envelope::{IV_SIZE, KeySource, WrappedKey},
    error::CryptoError,
    kdf::{self, DEFAULT_ITERATIONS, KEY_SIZE, SymmetricKey},
    keypair::PrivateKey,
};

/// Fixed salt for the custody key. The secret is already high-entropy, so the
/// salt only separates this use from any other use of the same secret.
const CUSTODY_SALT: &[u8] = b"murmur/custody/v1";

/// Deployment-wide custody secret (32 bytes).
///
/// Injected through configuration; there is no process-global copy.
pub struct DeploymentSecret([u8; KEY_SIZE]);

impl DeploymentSecret {
    /// Use raw secret bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex secret.
    ///
    /// # Errors
    ///
    /// - `InvalidSecret`: not hex, or not exactly 32 bytes
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let mut bytes =
            hex::decode(text.trim()).map_err(|e| CryptoError::InvalidSecret(e.to_string()))?;

        let result = <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
            .map(Self)
            .map_err(|_| CryptoError::InvalidSecret(format!("expected 32 bytes, got {}", bytes.len())));
        bytes.zeroize();
        result
    }

    /// Draw a new random secret.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Hex encoding, for writing into operator configuration.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Drop for DeploymentSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for DeploymentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeploymentSecret(..)")
    }
}

/// Wraps and unwraps private keys under the deployment secret.
///
/// The wrapping key is derived once, at construction. Wrap and unwrap then
/// cost one AES-GCM operation plus PKCS#8 encoding.
pub struct KeyCustodyService {
    key: SymmetricKey,
}

impl KeyCustodyService {
    /// Derive the custody key from `secret`.
    pub fn new(secret: &DeploymentSecret) -> Result<Self, CryptoError> {
        let key = kdf::derive(&secret.0, CUSTODY_SALT, DEFAULT_ITERATIONS)?;
        Ok(Self { key })
    }

    /// Wrap `private_key` with a fresh random IV.
    pub fn wrap<R>(&self, private_key: &PrivateKey, rng: &mut R) -> Result<WrappedKey, CryptoError>
    where
        R: RngCore + CryptoRng,
    {
        let mut iv = [0u8; IV_SIZE];
        rng.try_fill_bytes(&mut iv).map_err(|e| CryptoError::Wrap(e.to_string()))?;
        self.wrap_with(private_key, iv)
    }

    /// Wrap with a caller-chosen IV.
    pub fn wrap_with(
        &self,
        private_key: &PrivateKey,
        iv: [u8; IV_SIZE],
    ) -> Result<WrappedKey, CryptoError> {
        let der = private_key.to_pkcs8_der()?;
        WrappedKey::seal(&self.key, KeySource::Deployment, iv, &der)
    }

    /// Recover a custodied private key.
    ///
    /// # Errors
    ///
    /// - `Unwrap`: passphrase envelope, wrong deployment secret, or tampering
    pub fn unwrap(&self, wrapped: &WrappedKey) -> Result<PrivateKey, CryptoError> {
        if wrapped.source() != KeySource::Deployment {
            tracing::debug!("custody asked to open a passphrase envelope");
            return Err(CryptoError::Unwrap);
        }

        let der = wrapped.open(&self.key)?;

        PrivateKey::from_pkcs8_der(&der).map_err(|_| {
            tracing::debug!("custody envelope opened but plaintext is not a PKCS#8 key");
            CryptoError::Unwrap
        })
    }
}

impl fmt::Debug for KeyCustodyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCustodyService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::keypair::{DEFAULT_MODULUS_BITS, generate_keypair};

    const SECRET_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn secret_hex_roundtrip() {
        let secret = DeploymentSecret::from_hex(SECRET_HEX).unwrap();
        assert_eq!(secret.to_hex(), SECRET_HEX);
        assert_eq!(format!("{secret:?}"), "DeploymentSecret(..)");
    }

    #[test]
    fn secret_must_be_32_bytes_of_hex() {
        assert!(matches!(DeploymentSecret::from_hex("abcd"), Err(CryptoError::InvalidSecret(_))));
        assert!(matches!(
            DeploymentSecret::from_hex(&"zz".repeat(32)),
            Err(CryptoError::InvalidSecret(_))
        ));
    }

    #[test]
    fn custody_roundtrip_and_wrong_secret() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let pair = generate_keypair(&mut rng, DEFAULT_MODULUS_BITS).unwrap();

        let custody = KeyCustodyService::new(&DeploymentSecret::from_hex(SECRET_HEX).unwrap())
            .unwrap();
        let wrapped = custody.wrap(&pair.private, &mut rng).unwrap();

        assert!(wrapped.kdf_params().is_none());
        assert_eq!(custody.unwrap(&wrapped).unwrap(), pair.private);

        let other = KeyCustodyService::new(&DeploymentSecret::generate(&mut rng)).unwrap();
        assert_eq!(other.unwrap(&wrapped), Err(CryptoError::Unwrap));
    }
}
