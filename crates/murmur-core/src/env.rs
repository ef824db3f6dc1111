//! Environment abstraction for deterministic testing.
//!
//! Decouples domain logic from system resources (wall clock, randomness). Production
//! code runs against the OS clock and RNG; tests run against a seeded
//! environment so key generation and wrapping are reproducible.

use rand::{CryptoRng, RngCore};

/// Abstract environment providing wall-clock time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Seconds since the Unix epoch, for record timestamps.
    fn wall_clock_secs(&self) -> u64;

    /// Generates a random `u64`.
    ///
    /// Used for identity IDs.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// A CSPRNG handle drawing from this environment.
    ///
    /// Owns a clone of the environment so it can move onto a blocking thread.
    fn rng(&self) -> EnvRng<Self> {
        EnvRng(self.clone())
    }
}

/// Adapter exposing an [`Environment`] as `RngCore + CryptoRng`.
pub struct EnvRng<E>(E);

impl<E: Environment> RngCore for EnvRng<E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.0.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

// Sound only because `random_bytes` is required to be cryptographically secure.
impl<E: Environment> CryptoRng for EnvRng<E> {}

#[cfg(any(test, feature = "test-utils"))]
pub use seeded::SeededEnv;

#[cfg(any(test, feature = "test-utils"))]
mod seeded {
    #![allow(clippy::disallowed_types, reason = "Locking seeded RNG state")]

    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Deterministic environment: seeded `ChaCha20` RNG and a manual wall
    /// clock. Clones share state.
    #[derive(Clone)]
    pub struct SeededEnv {
        rng: Arc<Mutex<ChaCha20Rng>>,
        clock_secs: Arc<AtomicU64>,
    }

    impl SeededEnv {
        /// Environment seeded with `seed`, wall clock at 1,700,000,000.
        pub fn new(seed: u64) -> Self {
            Self {
                rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
                clock_secs: Arc::new(AtomicU64::new(1_700_000_000)),
            }
        }

        /// Move the wall clock forward.
        pub fn advance_clock(&self, by: Duration) {
            self.clock_secs.fetch_add(by.as_secs(), Ordering::SeqCst);
        }
    }

    impl Environment for SeededEnv {
        #[allow(clippy::expect_used)]
        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().expect("SeededEnv RNG mutex poisoned").fill_bytes(buffer);
        }

        fn wall_clock_secs(&self) -> u64 {
            self.clock_secs.load(Ordering::SeqCst)
        }
    }
}
