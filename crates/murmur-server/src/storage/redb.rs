//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. All state
//! survives restarts. Records are CBOR-encoded; keys are big-endian so range
//! scans follow numeric order.

use std::{path::Path, sync::Arc};

use murmur_core::{EncryptedMessage, Identity, IdentityId, KeyRecord, MessageId, StoredMessage};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{Storage, StorageError, check_first_key, newest_first, supersede_active};

/// Table: identities
/// Key: identity_id as big-endian bytes [8 bytes]
/// Value: CBOR-encoded Identity
const IDENTITIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("identities");

/// Table: usernames
/// Key: normalized username bytes
/// Value: identity_id as big-endian bytes [8 bytes]
const USERNAMES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("usernames");

/// Table: keys
/// Key: (identity_id: u64, generation: u32) as big-endian bytes [12 bytes]
/// Value: CBOR-encoded KeyRecord
const KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("keys");

/// Table: active_keys
/// Key: identity_id as big-endian bytes [8 bytes]
/// Value: active generation as big-endian bytes [4 bytes]
const ACTIVE_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("active_keys");

/// Table: messages
/// Key: (recipient: u64, log_index: u64) as big-endian bytes [16 bytes]
/// Value: CBOR-encoded EncryptedMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: sent
/// Key: (sender: u64, recipient: u64, log_index: u64) as big-endian bytes
/// [24 bytes]
/// Value: empty
const SENT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sent");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(IDENTITIES).map_err(io)?;
            let _ = txn.open_table(USERNAMES).map_err(io)?;
            let _ = txn.open_table(KEYS).map_err(io)?;
            let _ = txn.open_table(ACTIVE_KEYS).map_err(io)?;
            let _ = txn.open_table(MESSAGES).map_err(io)?;
            let _ = txn.open_table(SENT).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Find the latest log_index for a recipient.
    fn compute_latest_index<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        recipient: IdentityId,
    ) -> Result<Option<u64>, StorageError> {
        let start_key = encode_message_key(recipient, 0);
        let end_key = encode_message_key(recipient, u64::MAX);

        let mut range = table.range(start_key.as_slice()..=end_key.as_slice()).map_err(io)?;

        match range.next_back() {
            Some(entry) => {
                let (key, _) = entry.map_err(io)?;
                Ok(Some(decode_message_key(key.value()).1))
            },
            None => Ok(None),
        }
    }

    fn read_active_key<T, U>(
        active: &T,
        keys: &U,
        id: IdentityId,
    ) -> Result<Option<KeyRecord>, StorageError>
    where
        T: ReadableTable<&'static [u8], &'static [u8]>,
        U: ReadableTable<&'static [u8], &'static [u8]>,
    {
        let Some(generation) = active.get(id.0.to_be_bytes().as_slice()).map_err(io)? else {
            return Ok(None);
        };
        let generation = decode_u32(generation.value())?;

        let key = encode_key_key(id, generation);
        match keys.get(key.as_slice()).map_err(io)? {
            Some(bytes) => decode(bytes.value()).map(Some),
            None => Err(StorageError::Serialization(format!(
                "active generation {generation} of {id} has no key record"
            ))),
        }
    }
}

impl Storage for RedbStorage {
    fn create_identity(
        &self,
        identity: &Identity,
        first_key: &KeyRecord,
    ) -> Result<(), StorageError> {
        check_first_key(identity, first_key)?;
        let id_key = identity.id.0.to_be_bytes();

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut usernames = txn.open_table(USERNAMES).map_err(io)?;
            if usernames.get(identity.username.as_bytes()).map_err(io)?.is_some() {
                return Err(StorageError::UsernameTaken(identity.username.clone()));
            }

            let mut identities = txn.open_table(IDENTITIES).map_err(io)?;
            if identities.get(id_key.as_slice()).map_err(io)?.is_some() {
                return Err(StorageError::Conflict { expected: 0, got: identity.id.0 });
            }

            let mut keys = txn.open_table(KEYS).map_err(io)?;
            let mut active = txn.open_table(ACTIVE_KEYS).map_err(io)?;

            let identity_bytes = encode(identity)?;
            let key_bytes = encode(first_key)?;

            usernames.insert(identity.username.as_bytes(), id_key.as_slice()).map_err(io)?;
            identities.insert(id_key.as_slice(), identity_bytes.as_slice()).map_err(io)?;
            keys.insert(encode_key_key(identity.id, 0).as_slice(), key_bytes.as_slice())
                .map_err(io)?;
            active.insert(id_key.as_slice(), 0u32.to_be_bytes().as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn load_identity(&self, id: IdentityId) -> Result<Option<Identity>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(IDENTITIES).map_err(io)?;

        match table.get(id.0.to_be_bytes().as_slice()).map_err(io)? {
            Some(bytes) => decode(bytes.value()).map(Some),
            None => Ok(None),
        }
    }

    fn find_identity(&self, username: &str) -> Result<Option<Identity>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let usernames = txn.open_table(USERNAMES).map_err(io)?;

        let Some(id_bytes) = usernames.get(username.as_bytes()).map_err(io)? else {
            return Ok(None);
        };

        let identities = txn.open_table(IDENTITIES).map_err(io)?;
        match identities.get(id_bytes.value()).map_err(io)? {
            Some(bytes) => decode(bytes.value()).map(Some),
            None => Ok(None),
        }
    }

    fn active_key(&self, id: IdentityId) -> Result<Option<KeyRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let active = txn.open_table(ACTIVE_KEYS).map_err(io)?;
        let keys = txn.open_table(KEYS).map_err(io)?;

        Self::read_active_key(&active, &keys, id)
    }

    fn load_key(
        &self,
        id: IdentityId,
        generation: u32,
    ) -> Result<Option<KeyRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let keys = txn.open_table(KEYS).map_err(io)?;

        match keys.get(encode_key_key(id, generation).as_slice()).map_err(io)? {
            Some(bytes) => decode(bytes.value()).map(Some),
            None => Ok(None),
        }
    }

    fn rotate_key(&self, next: &KeyRecord, at_secs: u64) -> Result<(), StorageError> {
        let id = next.identity_id;
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut active = txn.open_table(ACTIVE_KEYS).map_err(io)?;
            let mut keys = txn.open_table(KEYS).map_err(io)?;

            let current = Self::read_active_key(&active, &keys, id)?;
            let superseded = supersede_active(current, next, at_secs)?;

            let superseded_bytes = encode(&superseded)?;
            let next_bytes = encode(next)?;

            keys.insert(
                encode_key_key(id, superseded.generation).as_slice(),
                superseded_bytes.as_slice(),
            )
            .map_err(io)?;
            keys.insert(encode_key_key(id, next.generation).as_slice(), next_bytes.as_slice())
                .map_err(io)?;
            active
                .insert(id.0.to_be_bytes().as_slice(), next.generation.to_be_bytes().as_slice())
                .map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn store_message(
        &self,
        recipient: IdentityId,
        log_index: u64,
        message: &EncryptedMessage,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let identities = txn.open_table(IDENTITIES).map_err(io)?;
            if identities.get(recipient.0.to_be_bytes().as_slice()).map_err(io)?.is_none() {
                return Err(StorageError::UnknownIdentity(recipient));
            }

            let mut messages = txn.open_table(MESSAGES).map_err(io)?;

            let expected_index =
                Self::compute_latest_index(&messages, recipient)?.map_or(0, |latest| latest + 1);

            if log_index != expected_index {
                return Err(StorageError::Conflict { expected: expected_index, got: log_index });
            }

            let bytes = encode(message)?;
            messages
                .insert(encode_message_key(recipient, log_index).as_slice(), bytes.as_slice())
                .map_err(io)?;

            if let Some(sender) = message.sender {
                let mut sent = txn.open_table(SENT).map_err(io)?;
                let key = encode_sent_key(sender, recipient, log_index);
                sent.insert(key.as_slice(), b"".as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn latest_message_index(&self, recipient: IdentityId) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        Self::compute_latest_index(&table, recipient)
    }

    fn load_messages(
        &self,
        recipient: IdentityId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        let start_key = encode_message_key(recipient, from);
        let end_key = encode_message_key(recipient, u64::MAX);

        let range = table.range(start_key.as_slice()..=end_key.as_slice()).map_err(io)?;

        let mut out = Vec::with_capacity(limit.min(256));
        for entry in range.take(limit) {
            let (key, value) = entry.map_err(io)?;
            let (_, index) = decode_message_key(key.value());
            out.push(StoredMessage {
                id: MessageId { recipient, index },
                message: decode(value.value())?,
            });
        }

        Ok(out)
    }

    fn load_sent(
        &self,
        sender: IdentityId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let sent = txn.open_table(SENT).map_err(io)?;
        let messages = txn.open_table(MESSAGES).map_err(io)?;

        let start_key = encode_sent_key(sender, IdentityId(0), 0);
        let end_key = encode_sent_key(sender, IdentityId(u64::MAX), u64::MAX);

        let mut out = Vec::new();
        for entry in sent.range(start_key.as_slice()..=end_key.as_slice()).map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            let (recipient, index) = decode_message_key(&key.value()[8..]);

            let message_key = encode_message_key(recipient, index);
            if let Some(bytes) = messages.get(message_key.as_slice()).map_err(io)? {
                out.push(StoredMessage {
                    id: MessageId { recipient, index },
                    message: decode(bytes.value())?,
                });
            }
        }

        newest_first(&mut out, limit);
        Ok(out)
    }
}

fn io(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_u32(bytes: &[u8]) -> Result<u32, StorageError> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StorageError::Serialization(format!("expected 4 bytes, got {}", bytes.len())))?;
    Ok(u32::from_be_bytes(array))
}

/// Encode (identity_id, generation) as a 12-byte big-endian key.
fn encode_key_key(id: IdentityId, generation: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&id.0.to_be_bytes());
    key[8..].copy_from_slice(&generation.to_be_bytes());
    key
}

/// Encode (recipient, log_index) as a 16-byte big-endian key.
fn encode_message_key(recipient: IdentityId, log_index: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&recipient.0.to_be_bytes());
    key[8..].copy_from_slice(&log_index.to_be_bytes());
    key
}

/// Decode a message key back to (recipient, log_index).
fn decode_message_key(key: &[u8]) -> (IdentityId, u64) {
    debug_assert_eq!(key.len(), 16);
    let mut recipient = [0u8; 8];
    let mut index = [0u8; 8];
    recipient.copy_from_slice(&key[..8]);
    index.copy_from_slice(&key[8..16]);
    (IdentityId(u64::from_be_bytes(recipient)), u64::from_be_bytes(index))
}

/// Encode (sender, recipient, log_index) as a 24-byte big-endian key.
fn encode_sent_key(sender: IdentityId, recipient: IdentityId, log_index: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&sender.0.to_be_bytes());
    key[8..].copy_from_slice(&encode_message_key(recipient, log_index));
    key
}
