//! Fuzz target for Storage under injected failures
//!
//! Drives `ChaoticStorage` over `MemoryStorage` with an arbitrary mix of
//! appends, stale appends, rotations and reads, then checks the underlying
//! store against a model of the writes that reported success.
//!
//! # Invariants
//!
//! - Storage NEVER panics on injected failures
//! - A failed write leaves no trace (atomic or nothing)
//! - Message logs are gap-free and match the successful appends
//! - Stale appends and stale rotations are refused with `Conflict`
//! - Each identity has exactly one active key, the newest generation

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use murmur_core::{Custody, EncryptedMessage, Identity, IdentityId, KeyRecord, KeyStatus};
use murmur_server::{ChaoticStorage, MemoryStorage, Storage, StorageError};

const IDENTITIES: u64 = 3;

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Append at the next free index
    Append { recipient: u8, sender: Option<u8> },
    /// Append at an index that is already taken
    StaleAppend { recipient: u8, back: u8 },
    /// Rotate to the next generation
    Rotate { identity: u8 },
    /// Rotate to a generation that is not the next one
    StaleRotate { identity: u8, generation: u32 },
    /// Read a slice of a log
    LoadMessages { recipient: u8, from: u8, limit: u8 },
    /// Read an outbox
    LoadSent { sender: u8, limit: u8 },
}

#[derive(Default)]
struct Model {
    /// Successful appends per recipient, as (sender, payload byte)
    logs: [Vec<(Option<u64>, u8)>; IDENTITIES as usize],
    /// Successful rotations per identity
    generations: [u32; IDENTITIES as usize],
}

fn id(raw: u8) -> u64 {
    u64::from(raw) % IDENTITIES + 1
}

fn key(identity: u64, generation: u32) -> KeyRecord {
    KeyRecord {
        identity_id: IdentityId(identity),
        generation,
        public_key_der: vec![generation as u8; 4],
        custody: Custody::Client,
        status: KeyStatus::Active,
        created_at_secs: u64::from(generation),
    }
}

fn message(recipient: u64, sender: Option<u64>, payload: u8) -> EncryptedMessage {
    EncryptedMessage {
        recipient: IdentityId(recipient),
        sender: sender.map(IdentityId),
        key_generation: 0,
        ciphertext: vec![payload; 8],
        created_at_secs: u64::from(payload),
    }
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;

    let memory = MemoryStorage::new();
    for n in 1..=IDENTITIES {
        let identity = Identity {
            id: IdentityId(n),
            username: format!("user{n}"),
            display_name: String::new(),
            created_at_secs: 0,
        };
        memory.create_identity(&identity, &key(n, 0)).expect("reliable setup");
    }

    let storage = ChaoticStorage::with_seed(memory, failure_rate, scenario.chaos_seed);
    let mut model = Model::default();

    for (step, op) in scenario.operations.iter().enumerate() {
        match *op {
            ChaosOperation::Append { recipient, sender } => {
                let recipient = id(recipient);
                let sender = sender.map(id);
                let slot = (recipient - 1) as usize;
                let index = model.logs[slot].len() as u64;
                let payload = step as u8;

                match storage.store_message(
                    IdentityId(recipient),
                    index,
                    &message(recipient, sender, payload),
                ) {
                    Ok(()) => model.logs[slot].push((sender, payload)),
                    Err(StorageError::Io(_)) => {},
                    Err(e) => panic!("unexpected append error: {e:?}"),
                }
            },

            ChaosOperation::StaleAppend { recipient, back } => {
                let recipient = id(recipient);
                let len = model.logs[(recipient - 1) as usize].len() as u64;
                if len == 0 {
                    continue;
                }
                let index = len - 1 - (u64::from(back) % len);

                match storage.store_message(IdentityId(recipient), index, &message(recipient, None, 0))
                {
                    Err(StorageError::Conflict { expected, got }) => {
                        assert_eq!(expected, len);
                        assert_eq!(got, index);
                    },
                    Err(StorageError::Io(_)) => {},
                    other => panic!("stale append must conflict, got {other:?}"),
                }
            },

            ChaosOperation::Rotate { identity } => {
                let identity = id(identity);
                let slot = (identity - 1) as usize;
                let next = model.generations[slot] + 1;

                match storage.rotate_key(&key(identity, next), step as u64) {
                    Ok(()) => model.generations[slot] = next,
                    Err(StorageError::Io(_)) => {},
                    Err(e) => panic!("unexpected rotation error: {e:?}"),
                }
            },

            ChaosOperation::StaleRotate { identity, generation } => {
                let identity = id(identity);
                let current = model.generations[(identity - 1) as usize];
                if generation == current.wrapping_add(1) {
                    continue;
                }

                match storage.rotate_key(&key(identity, generation), step as u64) {
                    Err(StorageError::Conflict { .. } | StorageError::Io(_)) => {},
                    other => panic!("stale rotation must conflict, got {other:?}"),
                }
            },

            ChaosOperation::LoadMessages { recipient, from, limit } => {
                let recipient = id(recipient);
                let len = model.logs[(recipient - 1) as usize].len() as u64;

                if let Ok(messages) =
                    storage.load_messages(IdentityId(recipient), u64::from(from), usize::from(limit))
                {
                    let expected = len.saturating_sub(u64::from(from)).min(u64::from(limit));
                    assert_eq!(messages.len() as u64, expected);
                    for (offset, stored) in messages.iter().enumerate() {
                        assert_eq!(stored.id.index, u64::from(from) + offset as u64);
                    }
                }
            },

            ChaosOperation::LoadSent { sender, limit } => {
                let sender = id(sender);
                if let Ok(sent) = storage.load_sent(IdentityId(sender), usize::from(limit)) {
                    assert!(sent.len() <= usize::from(limit));
                    assert!(sent.iter().all(|m| m.message.sender == Some(IdentityId(sender))));
                }
            },
        }
    }

    let inner = storage.inner();
    for n in 1..=IDENTITIES {
        let slot = (n - 1) as usize;
        let log = &model.logs[slot];

        let stored = inner.load_messages(IdentityId(n), 0, log.len() + 1).expect("reliable read");
        assert_eq!(stored.len(), log.len());
        for (index, (stored, (sender, payload))) in stored.iter().zip(log).enumerate() {
            assert_eq!(stored.id.index, index as u64);
            assert_eq!(stored.message.sender, sender.map(IdentityId));
            assert_eq!(stored.message.created_at_secs, u64::from(*payload));
        }

        let active = inner.active_key(IdentityId(n)).expect("reliable read").expect("active key");
        assert_eq!(active.generation, model.generations[slot]);
        for generation in 0..model.generations[slot] {
            let old = inner.load_key(IdentityId(n), generation).expect("reliable read");
            assert!(!old.expect("old generation kept").is_active());
        }
    }
});
