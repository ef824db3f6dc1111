//! Murmur message service.
//!
//! Production glue around [`murmur_core`] and [`murmur_crypto`]: durable
//! storage, the public key directory, the [`Postmaster`] service, the remote
//! classifier and the client key store used by the `murmur` binary.
//!
//! # Components
//!
//! - [`Postmaster`]: registration, submission (validate, screen, persist),
//!   inbox and sent listings, server-custody unlock, key rotation
//! - [`PublicKeyDirectory`]: username to active public key
//! - [`Storage`]: [`MemoryStorage`], [`RedbStorage`], [`ChaoticStorage`]
//! - [`OpenAiClassifier`]: remote moderation over chat completions
//! - [`FileKeyStore`]: client-side wrapped keys
//! - [`SystemEnv`]: production environment (real time, OS RNG)

#![forbid(unsafe_code)]

pub mod config;
pub mod directory;
mod error;
pub mod keystore;
pub mod openai;
pub mod postmaster;
pub mod storage;
mod system_env;

pub use directory::{DirectoryEntry, DirectoryError, PublicKeyDirectory};
pub use error::PostmasterError;
pub use keystore::{FileKeyStore, KeyStoreError, StoredKeys};
pub use openai::{OpenAiClassifier, OpenAiConfig};
pub use postmaster::{
    CustodyChoice, Delivery, Postmaster, PostmasterConfig, Registration, RegistrationReceipt,
};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
