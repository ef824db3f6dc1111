//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to test error handling. Used
//! for chaos testing to ensure the delivery path surfaces storage failures as
//! errors and never leaves half-written state behind.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex};

use murmur_core::{EncryptedMessage, Identity, IdentityId, KeyRecord, StoredMessage};

use super::{Storage, StorageError};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but randomly fails
/// operations based on a configured failure rate. A failed operation never
/// reaches the inner storage.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator: fast, and reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self { inner, failure_rate, rng: Arc::new(Mutex::new(ChaoticRng::new(seed))) }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn inject(&self) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        let roll = self.rng.lock().expect("ChaoticRng mutex poisoned").next();

        if roll < self.failure_rate {
            Err(StorageError::Io("chaotic failure injection".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn create_identity(
        &self,
        identity: &Identity,
        first_key: &KeyRecord,
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.create_identity(identity, first_key)
    }

    fn load_identity(&self, id: IdentityId) -> Result<Option<Identity>, StorageError> {
        self.inject()?;
        self.inner.load_identity(id)
    }

    fn find_identity(&self, username: &str) -> Result<Option<Identity>, StorageError> {
        self.inject()?;
        self.inner.find_identity(username)
    }

    fn active_key(&self, id: IdentityId) -> Result<Option<KeyRecord>, StorageError> {
        self.inject()?;
        self.inner.active_key(id)
    }

    fn load_key(
        &self,
        id: IdentityId,
        generation: u32,
    ) -> Result<Option<KeyRecord>, StorageError> {
        self.inject()?;
        self.inner.load_key(id, generation)
    }

    fn rotate_key(&self, next: &KeyRecord, at_secs: u64) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.rotate_key(next, at_secs)
    }

    fn store_message(
        &self,
        recipient: IdentityId,
        log_index: u64,
        message: &EncryptedMessage,
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_message(recipient, log_index, message)
    }

    fn latest_message_index(&self, recipient: IdentityId) -> Result<Option<u64>, StorageError> {
        self.inject()?;
        self.inner.latest_message_index(recipient)
    }

    fn load_messages(
        &self,
        recipient: IdentityId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        self.inject()?;
        self.inner.load_messages(recipient, from, limit)
    }

    fn load_sent(
        &self,
        sender: IdentityId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        self.inject()?;
        self.inner.load_sent(sender, limit)
    }
}
