//! Postmaster service.
//!
//! Ties together key generation and custody, the public key directory, the
//! moderation gate and storage. Every request surface (the CLI here, an HTTP
//! router elsewhere) goes through these operations.
//!
//! # Submission pipeline
//!
//! ```text
//! resolve recipient ──► validate ciphertext ──► screen ──► append to log
//!        │                      │                  │
//!     NotFound           Message error         Rejected (nothing stored)
//! ```
//!
//! CPU-heavy work (RSA generation, PBKDF2) runs on blocking worker threads so
//! the runtime keeps serving other requests.

use std::{fmt, sync::Arc};

use murmur_core::{
    Custody, EncryptedMessage, Environment, Identity, IdentityId, KeyRecord, Keyring, MessageId,
    ModerationGate, RejectReason, StoredMessage, Submission, Verdict,
    identity::normalize_username, message::decode_ciphertext,
};
use murmur_crypto::{
    KeyCustodyService, PrivateKeyVault, PublicKey, WrappedKey, generate_keypair,
    kdf::DEFAULT_ITERATIONS, keypair::DEFAULT_MODULUS_BITS,
};

use crate::{
    directory::{DirectoryEntry, PublicKeyDirectory},
    error::PostmasterError,
    storage::{Storage, StorageError},
};

/// Largest page returned by `inbox` and `sent`.
pub const MAX_PAGE_SIZE: usize = 500;

/// Postmaster configuration
#[derive(Debug, Clone, Copy)]
pub struct PostmasterConfig {
    /// RSA modulus size for new key pairs
    pub modulus_bits: usize,
    /// PBKDF2 iterations for new passphrase envelopes
    pub kdf_iterations: u32,
}

impl Default for PostmasterConfig {
    fn default() -> Self {
        Self { modulus_bits: DEFAULT_MODULUS_BITS, kdf_iterations: DEFAULT_ITERATIONS }
    }
}

/// Who keeps the private key of a new key generation.
#[derive(Clone)]
pub enum CustodyChoice {
    /// Wrap under this passphrase and hand the envelope to the client
    ClientPassphrase(String),
    /// Wrap under the deployment secret and keep the envelope server-side
    Server,
}

impl fmt::Debug for CustodyChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientPassphrase(_) => f.write_str("ClientPassphrase(..)"),
            Self::Server => f.write_str("Server"),
        }
    }
}

/// A registration request.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Requested username, normalized before use
    pub username: String,
    /// Free-form display name
    pub display_name: String,
    /// Private key custody
    pub custody: CustodyChoice,
}

/// Issued on registration and on every key rotation.
#[derive(Debug, Clone)]
pub struct RegistrationReceipt {
    /// The identity
    pub identity_id: IdentityId,
    /// Normalized username
    pub username: String,
    /// Generation of the new key
    pub generation: u32,
    /// Base64 SPKI public key
    pub public_key: String,
    /// Hex SHA-256 of the public key
    pub fingerprint: String,
    /// Passphrase envelope for the client to keep. `None` under server
    /// custody.
    pub wrapped_key: Option<WrappedKey>,
}

/// Business outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Message persisted
    Accepted {
        /// Where it was stored
        message_id: MessageId,
    },
    /// Message dropped by moderation; nothing was stored
    Rejected {
        /// Why
        reason: RejectReason,
    },
}

/// Message service over an environment and a storage backend.
pub struct Postmaster<E: Environment, S: Storage> {
    env: E,
    storage: S,
    directory: PublicKeyDirectory<S>,
    gate: ModerationGate,
    vault: PrivateKeyVault,
    custody: Option<Arc<KeyCustodyService>>,
    config: PostmasterConfig,
}

impl<E: Environment, S: Storage> Postmaster<E, S> {
    /// Create a postmaster without server custody.
    ///
    /// # Errors
    ///
    /// - `Crypto`: `config.kdf_iterations` outside the accepted range
    pub fn new(
        env: E,
        storage: S,
        gate: ModerationGate,
        config: PostmasterConfig,
    ) -> Result<Self, PostmasterError> {
        let vault = PrivateKeyVault::with_iterations(config.kdf_iterations)?;
        let directory = PublicKeyDirectory::new(storage.clone());

        Ok(Self { env, storage, directory, gate, vault, custody: None, config })
    }

    /// Enable server custody with `custody`.
    #[must_use]
    pub fn with_custody(mut self, custody: KeyCustodyService) -> Self {
        self.custody = Some(Arc::new(custody));
        self
    }

    /// Get a reference to storage
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The public key directory
    pub fn directory(&self) -> &PublicKeyDirectory<S> {
        &self.directory
    }

    /// Register a new identity with its first key generation.
    ///
    /// # Errors
    ///
    /// - `InvalidUsername`: name fails the naming rules
    /// - `CustodyDisabled`: server custody requested without a deployment
    ///   secret
    /// - `Storage(UsernameTaken)`: name already registered
    /// - `Crypto`: key generation or wrapping failed
    pub async fn register(
        &self,
        registration: Registration,
    ) -> Result<RegistrationReceipt, PostmasterError> {
        let username = normalize_username(&registration.username)?;
        self.check_custody(&registration.custody)?;

        // Early out before the expensive key generation; create_identity
        // still enforces uniqueness.
        if self.storage.find_identity(&username)?.is_some() {
            return Err(StorageError::UsernameTaken(username).into());
        }

        let (public, custody, wrapped_key) = self.generate_key(registration.custody).await?;
        let now = self.env.wall_clock_secs();

        let identity = Identity {
            id: IdentityId(self.env.random_u64()),
            username,
            display_name: registration.display_name.trim().to_string(),
            created_at_secs: now,
        };
        let server_custody = matches!(custody, Custody::Server(_));
        let record = KeyRecord::active(identity.id, 0, &public, custody, now);

        self.storage.create_identity(&identity, &record)?;

        tracing::info!(
            identity = %identity.id,
            username = %identity.username,
            server_custody,
            "identity registered"
        );

        Ok(RegistrationReceipt {
            identity_id: identity.id,
            username: identity.username,
            generation: 0,
            public_key: public.to_base64(),
            fingerprint: public.fingerprint(),
            wrapped_key,
        })
    }

    /// Active public key of `username`.
    pub fn public_key(&self, username: &str) -> Result<DirectoryEntry, PostmasterError> {
        Ok(self.directory.lookup(username)?)
    }

    /// Validate, screen and persist a message.
    ///
    /// A moderation rejection is `Ok(Delivery::Rejected)`; nothing is stored.
    /// The message is stored under the generation the sender encrypted to,
    /// which may already be superseded.
    ///
    /// # Errors
    ///
    /// - `Directory(NotFound)`: unknown recipient or key generation
    /// - `UnknownIdentity`: the stated sender does not exist
    /// - `Message`: ciphertext is not base64 or not one modulus block
    /// - `Storage`: persisting failed, including a second log conflict
    pub async fn submit(&self, submission: Submission) -> Result<Delivery, PostmasterError> {
        let active = self.directory.lookup(&submission.recipient)?;
        let entry = if submission.key_generation == active.generation {
            active
        } else {
            self.directory.key_at(active.identity_id, submission.key_generation)?
        };

        if let Some(sender) = submission.sender {
            if self.storage.load_identity(sender)?.is_none() {
                return Err(PostmasterError::UnknownIdentity(sender));
            }
        }

        let ciphertext = decode_ciphertext(&submission.ciphertext, entry.public_key.size())?;

        let outcome = self.gate.screen(submission.screening_text.as_deref()).await;
        if let Verdict::Reject(reason) = outcome.verdict {
            tracing::info!(
                recipient = %entry.identity_id,
                %reason,
                attempts = outcome.attempts,
                "submission rejected"
            );
            return Ok(Delivery::Rejected { reason });
        }

        let message = EncryptedMessage {
            recipient: entry.identity_id,
            sender: submission.sender,
            key_generation: entry.generation,
            ciphertext,
            created_at_secs: self.env.wall_clock_secs(),
        };

        let message_id = self.append(&message)?;
        tracing::info!(
            recipient = %message_id.recipient,
            index = message_id.index,
            generation = entry.generation,
            "message accepted"
        );

        Ok(Delivery::Accepted { message_id })
    }

    /// Messages for `identity` in log order, starting at `from`.
    ///
    /// Ciphertexts only; opening them is the recipient's job.
    pub fn inbox(
        &self,
        identity: IdentityId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PostmasterError> {
        self.require_identity(identity)?;
        Ok(self.storage.load_messages(identity, from, limit.min(MAX_PAGE_SIZE))?)
    }

    /// Messages sent by `sender`, newest first.
    pub fn sent(
        &self,
        sender: IdentityId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PostmasterError> {
        self.require_identity(sender)?;
        Ok(self.storage.load_sent(sender, limit.min(MAX_PAGE_SIZE))?)
    }

    /// Unwrap every server-custodied key generation of `identity`.
    ///
    /// Superseded generations are included so older messages stay readable.
    ///
    /// # Errors
    ///
    /// - `CustodyDisabled`: no deployment secret configured
    /// - `NotCustodied`: the active key is client-custodied
    /// - `Crypto(Unwrap)`: an envelope does not open under this secret
    pub fn unlock_custodied(&self, identity: IdentityId) -> Result<Keyring, PostmasterError> {
        let custody = self.custody.as_ref().ok_or(PostmasterError::CustodyDisabled)?;
        let active = self.active_key(identity)?;

        if !matches!(active.custody, Custody::Server(_)) {
            return Err(PostmasterError::NotCustodied(identity));
        }

        let mut keyring = Keyring::new();
        for generation in 0..=active.generation {
            let Some(record) = self.storage.load_key(identity, generation)? else {
                continue;
            };
            if let Custody::Server(wrapped) = &record.custody {
                keyring.insert(generation, custody.unwrap(wrapped)?);
            }
        }

        tracing::debug!(identity = %identity, generations = keyring.len(), "custodied keys unlocked");
        Ok(keyring)
    }

    /// Replace the active key of `identity` with a fresh pair.
    ///
    /// The old generation is marked superseded, never deleted.
    ///
    /// # Errors
    ///
    /// - `Storage(Conflict)`: another rotation won the race; re-read and retry
    /// - `GenerationsExhausted`: the active key is generation `u32::MAX`
    /// - `CustodyDisabled`: server custody requested without a deployment
    ///   secret
    pub async fn rotate_key(
        &self,
        identity: IdentityId,
        custody: CustodyChoice,
    ) -> Result<RegistrationReceipt, PostmasterError> {
        self.check_custody(&custody)?;
        let owner = self.require_identity(identity)?;
        let active = self.active_key(identity)?;
        let generation = active
            .generation
            .checked_add(1)
            .ok_or(PostmasterError::GenerationsExhausted(identity))?;

        let (public, custody, wrapped_key) = self.generate_key(custody).await?;
        let now = self.env.wall_clock_secs();
        let next = KeyRecord::active(identity, generation, &public, custody, now);

        self.storage.rotate_key(&next, now)?;

        tracing::info!(
            identity = %identity,
            superseded = active.generation,
            generation = next.generation,
            "key rotated"
        );

        Ok(RegistrationReceipt {
            identity_id: identity,
            username: owner.username,
            generation: next.generation,
            public_key: public.to_base64(),
            fingerprint: public.fingerprint(),
            wrapped_key,
        })
    }

    fn check_custody(&self, choice: &CustodyChoice) -> Result<(), PostmasterError> {
        if matches!(choice, CustodyChoice::Server) && self.custody.is_none() {
            return Err(PostmasterError::CustodyDisabled);
        }
        Ok(())
    }

    fn require_identity(&self, identity: IdentityId) -> Result<Identity, PostmasterError> {
        self.storage.load_identity(identity)?.ok_or(PostmasterError::UnknownIdentity(identity))
    }

    fn active_key(&self, identity: IdentityId) -> Result<KeyRecord, PostmasterError> {
        self.storage.active_key(identity)?.ok_or(PostmasterError::NoActiveKey(identity))
    }

    /// Generate a key pair and wrap the private half, on a blocking thread.
    async fn generate_key(
        &self,
        choice: CustodyChoice,
    ) -> Result<(PublicKey, Custody, Option<WrappedKey>), PostmasterError> {
        let mut rng = self.env.rng();
        let bits = self.config.modulus_bits;
        let vault = self.vault;
        let custody = self.custody.clone();

        tokio::task::spawn_blocking(move || -> Result<_, PostmasterError> {
            let pair = generate_keypair(&mut rng, bits)?;

            match choice {
                CustodyChoice::ClientPassphrase(passphrase) => {
                    let wrapped = vault.wrap(&pair.private, &passphrase, &mut rng)?;
                    Ok((pair.public, Custody::Client, Some(wrapped)))
                },
                CustodyChoice::Server => {
                    let service = custody.ok_or(PostmasterError::CustodyDisabled)?;
                    let wrapped = service.wrap(&pair.private, &mut rng)?;
                    Ok((pair.public, Custody::Server(wrapped), None))
                },
            }
        })
        .await?
    }

    /// Append at the end of the recipient's log, retrying once on a lost race.
    fn append(&self, message: &EncryptedMessage) -> Result<MessageId, PostmasterError> {
        let recipient = message.recipient;
        let mut retried = false;

        loop {
            let index = self.storage.latest_message_index(recipient)?.map_or(0, |i| i + 1);

            match self.storage.store_message(recipient, index, message) {
                Ok(()) => return Ok(MessageId { recipient, index }),
                Err(err) if err.is_conflict() && !retried => {
                    tracing::debug!(recipient = %recipient, index, "log index conflict, retrying");
                    retried = true;
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}
