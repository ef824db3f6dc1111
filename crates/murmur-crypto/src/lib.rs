//! Murmur Cryptographic Primitives
//!
//! Key lifecycle and message encryption for Murmur. Functions are pure where
//! they can be: randomness comes from a caller-supplied CSPRNG, so tests run
//! against seeded generators and production against the OS.
//!
//! # Key Lifecycle
//!
//! Each identity owns one RSA key pair per key generation. The public half is
//! published; the private half is sealed before it is stored anywhere, either
//! under the user's passphrase (client custody) or under the deployment
//! secret (server custody).
//!
//! ```text
//! generate_keypair ──► PublicKey ──► directory ──► cipher::encrypt (sender)
//!        │
//!        ▼
//!   PrivateKey ──► PrivateKeyVault::wrap    (passphrase, PBKDF2 + AES-GCM)
//!              └─► KeyCustodyService::wrap  (deployment secret, AES-GCM)
//!                          │
//!                          ▼
//!                     WrappedKey ──► unwrap ──► cipher::decrypt (recipient)
//! ```
//!
//! # Security
//!
//! Confidentiality:
//! - RSA-OAEP with SHA-256 for messages; only the recipient can read them
//! - AES-256-GCM for private keys at rest, fresh IV per wrap
//! - PBKDF2-HMAC-SHA256, 100k iterations by default, parameters stored per
//!   envelope
//!
//! No oracles:
//! - Unwrap has one failure (`CryptoError::Unwrap`), decryption has one
//!   (`CryptoError::Decryption`)
//! - Causes are logged at debug level only
//!
//! Not provided: sender authentication, forward secrecy, multi-device sync.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod custody;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keypair;
pub mod vault;

pub use cipher::{decrypt, decrypt_text, encrypt, encrypt_to_encoded, max_plaintext_len};
pub use custody::{DeploymentSecret, KeyCustodyService};
pub use envelope::{KeySource, WrappedKey};
pub use error::{CryptoError, EncryptionError};
pub use kdf::{KdfParams, SymmetricKey};
pub use keypair::{KeyPair, PrivateKey, PublicKey, generate_keypair};
pub use vault::PrivateKeyVault;
