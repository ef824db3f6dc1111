//! Passphrase-wrapped private keys for client-side storage.
//!
//! The passphrase never leaves the client and is never stored. Losing it
//! means losing the private key, and with it every message encrypted to that
//! key.

use rand::{CryptoRng, RngCore};

use crate::{
    envelope::{IV_SIZE, KeySource, WrappedKey},
    error::CryptoError,
    kdf::{DEFAULT_ITERATIONS, KdfParams, SALT_SIZE},
    keypair::PrivateKey,
};

/// Wraps and unwraps private keys under a user passphrase.
#[derive(Debug, Clone, Copy)]
pub struct PrivateKeyVault {
    iterations: u32,
}

impl PrivateKeyVault {
    /// Vault using [`DEFAULT_ITERATIONS`] for new wraps.
    pub fn new() -> Self {
        Self { iterations: DEFAULT_ITERATIONS }
    }

    /// Vault with a custom iteration count for new wraps.
    ///
    /// Unwrapping always uses the count recorded in the envelope.
    pub fn with_iterations(iterations: u32) -> Result<Self, CryptoError> {
        KdfParams::v1(iterations, [0u8; SALT_SIZE])?;
        Ok(Self { iterations })
    }

    /// Iteration count used for new wraps.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Wrap `private_key` under `passphrase` with a fresh random salt and IV.
    pub fn wrap<R>(
        &self,
        private_key: &PrivateKey,
        passphrase: &str,
        rng: &mut R,
    ) -> Result<WrappedKey, CryptoError>
    where
        R: RngCore + CryptoRng,
    {
        let mut salt = [0u8; SALT_SIZE];
        let mut iv = [0u8; IV_SIZE];
        rng.try_fill_bytes(&mut salt).map_err(|e| CryptoError::Wrap(e.to_string()))?;
        rng.try_fill_bytes(&mut iv).map_err(|e| CryptoError::Wrap(e.to_string()))?;

        self.wrap_with(private_key, passphrase, salt, iv)
    }

    /// Wrap with caller-chosen salt and IV.
    pub fn wrap_with(
        &self,
        private_key: &PrivateKey,
        passphrase: &str,
        salt: [u8; SALT_SIZE],
        iv: [u8; IV_SIZE],
    ) -> Result<WrappedKey, CryptoError> {
        let params = KdfParams::v1(self.iterations, salt)?;
        let key = params.derive(passphrase.as_bytes())?;
        let der = private_key.to_pkcs8_der()?;

        WrappedKey::seal(&key, KeySource::Passphrase(params), iv, &der)
    }

    /// Recover the private key from `wrapped` with `passphrase`.
    ///
    /// # Errors
    ///
    /// - `Unwrap`: for every failure. A wrong passphrase and a corrupted
    ///   envelope are indistinguishable to the caller.
    pub fn unwrap(&self, wrapped: &WrappedKey, passphrase: &str) -> Result<PrivateKey, CryptoError> {
        let Some(params) = wrapped.kdf_params() else {
            tracing::debug!("envelope has no KDF parameters; not a passphrase envelope");
            return Err(CryptoError::Unwrap);
        };

        let key = params.derive(passphrase.as_bytes()).map_err(|e| {
            tracing::debug!(error = %e, "KDF rejected envelope parameters");
            CryptoError::Unwrap
        })?;

        let der = wrapped.open(&key)?;

        PrivateKey::from_pkcs8_der(&der).map_err(|_| {
            tracing::debug!("envelope opened but plaintext is not a PKCS#8 key");
            CryptoError::Unwrap
        })
    }
}

impl Default for PrivateKeyVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::{
        kdf::MIN_ITERATIONS,
        keypair::{DEFAULT_MODULUS_BITS, generate_keypair},
    };

    fn fixture() -> (PrivateKeyVault, PrivateKey, ChaCha20Rng) {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let pair = generate_keypair(&mut rng, DEFAULT_MODULUS_BITS).unwrap();
        (PrivateKeyVault::with_iterations(MIN_ITERATIONS).unwrap(), pair.private, rng)
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let (vault, private, mut rng) = fixture();

        let wrapped = vault.wrap(&private, "p1", &mut rng).unwrap();
        let restored = vault.unwrap(&wrapped, "p1").unwrap();

        assert_eq!(restored, private);
        assert_eq!(wrapped.kdf_params().map(KdfParams::iterations), Some(MIN_ITERATIONS));
    }

    #[test]
    fn wrong_passphrase_is_unwrap_failure() {
        let (vault, private, mut rng) = fixture();

        let wrapped = vault.wrap(&private, "p1", &mut rng).unwrap();
        assert_eq!(vault.unwrap(&wrapped, "p2"), Err(CryptoError::Unwrap));
    }

    #[test]
    fn each_wrap_uses_fresh_salt_and_iv() {
        let (vault, private, mut rng) = fixture();

        let a = vault.wrap(&private, "p1", &mut rng).unwrap();
        let b = vault.wrap(&private, "p1", &mut rng).unwrap();

        assert_ne!(a.iv(), b.iv());
        assert_ne!(a.kdf_params().map(KdfParams::salt), b.kdf_params().map(KdfParams::salt));
        assert_ne!(a.ciphertext(), b.ciphertext());
    }

    #[test]
    fn unwrap_honours_envelope_iterations() {
        let (vault, private, mut rng) = fixture();
        let wrapped = vault.wrap(&private, "p1", &mut rng).unwrap();

        // A vault configured for more iterations still opens older envelopes.
        let stronger = PrivateKeyVault::with_iterations(MIN_ITERATIONS * 2).unwrap();
        assert_eq!(stronger.unwrap(&wrapped, "p1").unwrap(), private);
    }

    #[test]
    fn deployment_envelope_is_rejected() {
        let (vault, private, _) = fixture();
        let der = private.to_pkcs8_der().unwrap();
        let key = crate::kdf::SymmetricKey::from_bytes([1u8; 32]);
        let wrapped = WrappedKey::seal(&key, KeySource::Deployment, [0u8; 12], &der).unwrap();

        assert_eq!(vault.unwrap(&wrapped, "p1"), Err(CryptoError::Unwrap));
    }

    #[test]
    fn iteration_count_below_floor_is_refused() {
        assert!(PrivateKeyVault::with_iterations(10).is_err());
    }
}
