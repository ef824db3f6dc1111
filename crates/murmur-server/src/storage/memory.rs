#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use murmur_core::{EncryptedMessage, Identity, IdentityId, KeyRecord, MessageId, StoredMessage};

use super::{Storage, StorageError, check_first_key, newest_first, supersede_active};

/// In-memory storage implementation for testing and simulation
///
/// Uses `HashMap` for lookups and `Vec` for ordered logs. All state is wrapped
/// in Arc<Mutex<>> to allow Clone and concurrent access. Uses `lock().expect()`
/// which will panic if the mutex is poisoned - acceptable for test code.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    identities: HashMap<IdentityId, Identity>,

    /// Normalized username -> identity
    usernames: HashMap<String, IdentityId>,

    /// Key generations per identity, indexed by generation. The last entry is
    /// the active one.
    keys: HashMap<IdentityId, Vec<KeyRecord>>,

    /// Messages per recipient, stored in `log_index` order
    messages: HashMap<IdentityId, Vec<EncryptedMessage>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                identities: HashMap::new(),
                usernames: HashMap::new(),
                keys: HashMap::new(),
                messages: HashMap::new(),
            })),
        }
    }

    /// Total number of messages across all recipients.
    ///
    /// Useful for debugging and testing.
    #[allow(clippy::expect_used)]
    pub fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.messages.values().map(Vec::len).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn create_identity(
        &self,
        identity: &Identity,
        first_key: &KeyRecord,
    ) -> Result<(), StorageError> {
        check_first_key(identity, first_key)?;
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if inner.usernames.contains_key(&identity.username) {
            return Err(StorageError::UsernameTaken(identity.username.clone()));
        }
        if inner.identities.contains_key(&identity.id) {
            return Err(StorageError::Conflict { expected: 0, got: identity.id.0 });
        }

        inner.usernames.insert(identity.username.clone(), identity.id);
        inner.identities.insert(identity.id, identity.clone());
        inner.keys.insert(identity.id, vec![first_key.clone()]);

        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn load_identity(&self, id: IdentityId) -> Result<Option<Identity>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.identities.get(&id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn find_identity(&self, username: &str) -> Result<Option<Identity>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.usernames.get(username).and_then(|id| inner.identities.get(id)).cloned())
    }

    #[allow(clippy::expect_used)]
    fn active_key(&self, id: IdentityId) -> Result<Option<KeyRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.keys.get(&id).and_then(|keys| keys.last()).cloned())
    }

    #[allow(clippy::expect_used)]
    fn load_key(
        &self,
        id: IdentityId,
        generation: u32,
    ) -> Result<Option<KeyRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.keys.get(&id).and_then(|keys| keys.get(generation as usize)).cloned())
    }

    #[allow(clippy::expect_used)]
    fn rotate_key(&self, next: &KeyRecord, at_secs: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let keys = inner
            .keys
            .get_mut(&next.identity_id)
            .ok_or(StorageError::UnknownIdentity(next.identity_id))?;

        let superseded = supersede_active(keys.last().cloned(), next, at_secs)?;
        let last = keys.len() - 1;
        keys[last] = superseded;
        keys.push(next.clone());

        debug_assert_eq!(keys.len() as u32 - 1, next.generation);
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn store_message(
        &self,
        recipient: IdentityId,
        log_index: u64,
        message: &EncryptedMessage,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if !inner.identities.contains_key(&recipient) {
            return Err(StorageError::UnknownIdentity(recipient));
        }

        let log = inner.messages.entry(recipient).or_default();
        let expected_index = log.len() as u64;

        if log_index != expected_index {
            return Err(StorageError::Conflict { expected: expected_index, got: log_index });
        }

        log.push(message.clone());
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn latest_message_index(&self, recipient: IdentityId) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .messages
            .get(&recipient)
            .and_then(|log| if log.is_empty() { None } else { Some(log.len() as u64 - 1) }))
    }

    #[allow(clippy::expect_used)]
    fn load_messages(
        &self,
        recipient: IdentityId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(log) = inner.messages.get(&recipient) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(limit)
            .map(|(index, message)| StoredMessage {
                id: MessageId { recipient, index: index as u64 },
                message: message.clone(),
            })
            .collect())
    }

    #[allow(clippy::expect_used)]
    fn load_sent(
        &self,
        sender: IdentityId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let mut sent: Vec<StoredMessage> = inner
            .messages
            .iter()
            .flat_map(|(recipient, log)| {
                log.iter().enumerate().filter(|(_, m)| m.sender == Some(sender)).map(
                    |(index, message)| StoredMessage {
                        id: MessageId { recipient: *recipient, index: index as u64 },
                        message: message.clone(),
                    },
                )
            })
            .collect();

        newest_first(&mut sent, limit);
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use murmur_core::{Custody, KeyStatus};

    use super::*;

    fn identity(id: u64, name: &str) -> Identity {
        Identity {
            id: IdentityId(id),
            username: name.to_string(),
            display_name: name.to_string(),
            created_at_secs: 1,
        }
    }

    fn key(id: u64, generation: u32) -> KeyRecord {
        KeyRecord {
            identity_id: IdentityId(id),
            generation,
            public_key_der: vec![generation as u8],
            custody: Custody::Client,
            status: KeyStatus::Active,
            created_at_secs: u64::from(generation),
        }
    }

    fn message(recipient: u64, sender: Option<u64>, at: u64) -> EncryptedMessage {
        EncryptedMessage {
            recipient: IdentityId(recipient),
            sender: sender.map(IdentityId),
            key_generation: 0,
            ciphertext: vec![0u8; 4],
            created_at_secs: at,
        }
    }

    #[test]
    fn create_and_find_identity() {
        let storage = MemoryStorage::new();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();

        assert_eq!(storage.find_identity("alice").unwrap(), Some(identity(1, "alice")));
        assert_eq!(storage.active_key(IdentityId(1)).unwrap(), Some(key(1, 0)));
        assert_eq!(storage.find_identity("bob").unwrap(), None);
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let storage = MemoryStorage::new();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();

        let result = storage.create_identity(&identity(2, "alice"), &key(2, 0));
        assert_eq!(result, Err(StorageError::UsernameTaken("alice".into())));
        assert_eq!(storage.load_identity(IdentityId(2)).unwrap(), None);
    }

    #[test]
    fn rotation_supersedes_previous_generation() {
        let storage = MemoryStorage::new();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();

        storage.rotate_key(&key(1, 1), 50).unwrap();

        let old = storage.load_key(IdentityId(1), 0).unwrap().unwrap();
        assert_eq!(old.status, KeyStatus::Superseded { at_secs: 50, by_generation: 1 });
        assert_eq!(storage.active_key(IdentityId(1)).unwrap(), Some(key(1, 1)));
    }

    #[test]
    fn stale_rotation_conflicts() {
        let storage = MemoryStorage::new();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();
        storage.rotate_key(&key(1, 1), 50).unwrap();

        let result = storage.rotate_key(&key(1, 1), 60);
        assert_eq!(result, Err(StorageError::Conflict { expected: 2, got: 1 }));
    }

    #[test]
    fn message_log_rejects_gaps() {
        let storage = MemoryStorage::new();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();

        storage.store_message(IdentityId(1), 0, &message(1, None, 1)).unwrap();
        let result = storage.store_message(IdentityId(1), 2, &message(1, None, 2));

        assert_eq!(result, Err(StorageError::Conflict { expected: 1, got: 2 }));
        assert_eq!(storage.latest_message_index(IdentityId(1)).unwrap(), Some(0));
    }

    #[test]
    fn sent_listing_is_newest_first() {
        let storage = MemoryStorage::new();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();
        storage.create_identity(&identity(2, "carol"), &key(2, 0)).unwrap();

        storage.store_message(IdentityId(1), 0, &message(1, Some(9), 10)).unwrap();
        storage.store_message(IdentityId(2), 0, &message(2, Some(9), 30)).unwrap();
        storage.store_message(IdentityId(1), 1, &message(1, None, 20)).unwrap();

        let sent = storage.load_sent(IdentityId(9), 10).unwrap();
        let times: Vec<u64> = sent.iter().map(|m| m.message.created_at_secs).collect();
        assert_eq!(times, vec![30, 10]);
        assert_eq!(storage.total_message_count(), 3);
    }
}
