//! Batch decryption of a recipient's inbox.
//!
//! Each message is opened independently. A message that cannot be read is
//! reported in place; it never aborts the rest of the batch.

use std::collections::BTreeMap;

use murmur_crypto::{PrivateKey, cipher};

use crate::{
    identity::IdentityId,
    message::{MessageId, StoredMessage},
};

/// Private keys of one identity, by key generation.
#[derive(Debug, Default, Clone)]
pub struct Keyring {
    keys: BTreeMap<u32, PrivateKey>,
}

impl Keyring {
    /// Empty keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyring holding a single generation.
    pub fn with_key(generation: u32, key: PrivateKey) -> Self {
        let mut ring = Self::new();
        ring.insert(generation, key);
        ring
    }

    /// Add or replace the key for `generation`.
    pub fn insert(&mut self, generation: u32, key: PrivateKey) {
        self.keys.insert(generation, key);
    }

    /// Key for `generation`, if held.
    pub fn get(&self, generation: u32) -> Option<&PrivateKey> {
        self.keys.get(&generation)
    }

    /// Number of generations held.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no keys are held.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Why a single message could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// Decryption failed with the matching key
    Unreadable,
    /// The message was encrypted to a generation not in the keyring
    KeyUnavailable {
        /// Generation the message needs
        generation: u32,
    },
}

/// One inbox entry after an attempt to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    /// Where the message lives
    pub id: MessageId,
    /// Authenticated sender, if any
    pub sender: Option<IdentityId>,
    /// Unix timestamp (seconds) of acceptance
    pub created_at_secs: u64,
    /// Plaintext, or why it could not be recovered
    pub body: Result<String, ReadFailure>,
}

/// Open every message in `messages` with `keyring`.
///
/// Output order matches input order.
pub fn open_all(messages: &[StoredMessage], keyring: &Keyring) -> Vec<OpenedMessage> {
    messages
        .iter()
        .map(|stored| {
            let generation = stored.message.key_generation;
            let body = match keyring.get(generation) {
                Some(key) => open_one(&stored.message.ciphertext, key),
                None => Err(ReadFailure::KeyUnavailable { generation }),
            };

            if let Err(failure) = &body {
                tracing::debug!(index = stored.id.index, ?failure, "message could not be opened");
            }

            OpenedMessage {
                id: stored.id,
                sender: stored.message.sender,
                created_at_secs: stored.message.created_at_secs,
                body,
            }
        })
        .collect()
}

fn open_one(ciphertext: &[u8], key: &PrivateKey) -> Result<String, ReadFailure> {
    let plaintext = cipher::decrypt(ciphertext, key).map_err(|_| ReadFailure::Unreadable)?;
    String::from_utf8(plaintext).map_err(|_| ReadFailure::Unreadable)
}

#[cfg(test)]
mod tests {
    use murmur_crypto::{cipher, generate_keypair, keypair::DEFAULT_MODULUS_BITS};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::message::EncryptedMessage;

    fn stored(index: u64, generation: u32, ciphertext: Vec<u8>) -> StoredMessage {
        StoredMessage {
            id: MessageId { recipient: IdentityId(1), index },
            message: EncryptedMessage {
                recipient: IdentityId(1),
                sender: None,
                key_generation: generation,
                ciphertext,
                created_at_secs: 10 + index,
            },
        }
    }

    #[test]
    fn failures_do_not_abort_the_batch() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let current = generate_keypair(&mut rng, DEFAULT_MODULUS_BITS).unwrap();

        let good = cipher::encrypt(b"hello", &current.public, &mut rng).unwrap();
        let mut corrupted = cipher::encrypt(b"lost", &current.public, &mut rng).unwrap();
        corrupted[10] ^= 0xff;

        let messages = vec![
            stored(0, 0, good.clone()),
            stored(1, 0, corrupted),
            stored(2, 3, good),
        ];
        let opened = open_all(&messages, &Keyring::with_key(0, current.private));

        assert_eq!(opened.len(), 3);
        assert_eq!(opened[0].body, Ok("hello".to_string()));
        assert_eq!(opened[1].body, Err(ReadFailure::Unreadable));
        assert_eq!(opened[2].body, Err(ReadFailure::KeyUnavailable { generation: 3 }));
        assert_eq!(opened[2].id.index, 2);
    }

    #[test]
    fn empty_keyring_flags_every_message() {
        let opened = open_all(&[stored(0, 1, vec![0u8; 256])], &Keyring::new());
        assert_eq!(opened[0].body, Err(ReadFailure::KeyUnavailable { generation: 1 }));
    }
}
