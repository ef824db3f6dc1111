//! Storage abstraction for Murmur
//!
//! Trait-based abstraction for persisting identities, key generations and
//! per-recipient message logs. The trait is synchronous (no async) so the
//! implementations stay simple; callers on an async runtime treat each call as
//! a short blocking operation.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use murmur_core::{EncryptedMessage, Identity, IdentityId, KeyRecord, StoredMessage};

pub use self::redb::RedbStorage;

/// Storage abstraction for identities, keys and messages
///
/// Must be Clone (shared by the service and its blocking workers), Send + Sync
/// (thread-safe), and synchronous. Implementations share internal state via
/// Arc, so clones access the same underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock).
pub trait Storage: Clone + Send + Sync + 'static {
    /// Create an identity together with its first key generation.
    ///
    /// Atomic: either both records exist afterwards or neither does.
    ///
    /// # Invariants
    ///
    /// - Pre: `identity.username` is not taken, `identity.id` is unused
    /// - Pre: `first_key.generation == 0` and it is active
    /// - Post: `active_key(identity.id)` returns `first_key`
    fn create_identity(&self, identity: &Identity, first_key: &KeyRecord)
    -> Result<(), StorageError>;

    /// Load an identity by ID.
    fn load_identity(&self, id: IdentityId) -> Result<Option<Identity>, StorageError>;

    /// Look up an identity by normalized username.
    fn find_identity(&self, username: &str) -> Result<Option<Identity>, StorageError>;

    /// The active key generation of an identity.
    ///
    /// Returns `None` if the identity doesn't exist.
    fn active_key(&self, id: IdentityId) -> Result<Option<KeyRecord>, StorageError>;

    /// A specific key generation, active or superseded.
    fn load_key(&self, id: IdentityId, generation: u32)
    -> Result<Option<KeyRecord>, StorageError>;

    /// Replace the active key with `next`, marking the old one superseded.
    ///
    /// Atomic compare-and-set on the active generation: two concurrent
    /// rotations cannot both succeed.
    ///
    /// # Invariants
    ///
    /// - Pre: `next.generation` equals the active generation + 1, otherwise
    ///   `Conflict`
    /// - Post: `load_key(id, next.generation - 1)` is `Superseded`
    fn rotate_key(&self, next: &KeyRecord, at_secs: u64) -> Result<(), StorageError>;

    /// Append a message to the recipient's log at the given index.
    ///
    /// # Invariants
    ///
    /// - Pre: `log_index` must equal the current length of the recipient's log
    /// - Post: message is persisted at `log_index`
    fn store_message(
        &self,
        recipient: IdentityId,
        log_index: u64,
        message: &EncryptedMessage,
    ) -> Result<(), StorageError>;

    /// Latest log index for a recipient. `None` if no messages stored.
    fn latest_message_index(&self, recipient: IdentityId) -> Result<Option<u64>, StorageError>;

    /// Load messages from a recipient's log
    ///
    /// Returns messages in range `[from, from+limit)` in log order. If fewer
    /// than `limit` messages exist, returns all available ones.
    fn load_messages(
        &self,
        recipient: IdentityId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError>;

    /// Messages sent by an authenticated sender, newest first.
    fn load_sent(&self, sender: IdentityId, limit: usize)
    -> Result<Vec<StoredMessage>, StorageError>;
}

/// Check the preconditions shared by every `create_identity` implementation.
fn check_first_key(identity: &Identity, first_key: &KeyRecord) -> Result<(), StorageError> {
    if first_key.generation != 0 {
        return Err(StorageError::Conflict { expected: 0, got: u64::from(first_key.generation) });
    }
    debug_assert_eq!(first_key.identity_id, identity.id);
    debug_assert!(first_key.is_active());
    Ok(())
}

/// Apply the `Active -> Superseded` transition for `rotate_key`.
///
/// Returns the superseded record to write back.
fn supersede_active(
    active: Option<KeyRecord>,
    next: &KeyRecord,
    at_secs: u64,
) -> Result<KeyRecord, StorageError> {
    let Some(mut current) = active else {
        return Err(StorageError::UnknownIdentity(next.identity_id));
    };

    let conflict = StorageError::Conflict {
        expected: u64::from(current.generation) + 1,
        got: u64::from(next.generation),
    };

    // Rejects a stale active record and any generation gap.
    current.supersede(next, at_secs).map_err(|_| conflict)?;
    Ok(current)
}

/// Newest-first ordering for sent listings.
fn newest_first(messages: &mut Vec<StoredMessage>, limit: usize) {
    messages.sort_by(|a, b| {
        b.message.created_at_secs.cmp(&a.message.created_at_secs).then(b.id.cmp(&a.id))
    });
    messages.truncate(limit);
}
