//! Chaos property tests for Storage implementations
//!
//! Storage wrapped in `ChaoticStorage` fails at random. These tests check the
//! invariants that must hold regardless:
//! - Message logs stay gap-free; a failed append leaves nothing behind
//! - Every accepted submission is readable afterwards
//! - Rotation never leaves two active generations or none

use std::sync::Arc;

use murmur_core::{
    BlocklistClassifier, Custody, EncryptedMessage, Identity, IdentityId, KeyRecord, KeyStatus,
    ModerationGate, Submission, env::SeededEnv,
};
use murmur_crypto::{cipher, encoding, kdf::MIN_ITERATIONS};
use murmur_server::{
    ChaoticStorage, CustodyChoice, Delivery, MemoryStorage, Postmaster, PostmasterConfig,
    PostmasterError, RedbStorage, Registration, Storage, StorageError,
};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tempfile::tempdir;

fn seed_identity(storage: &impl Storage, id: u64) {
    let identity = Identity {
        id: IdentityId(id),
        username: format!("user{id}"),
        display_name: String::new(),
        created_at_secs: 0,
    };
    let key = KeyRecord {
        identity_id: IdentityId(id),
        generation: 0,
        public_key_der: vec![0u8; 4],
        custody: Custody::Client,
        status: KeyStatus::Active,
        created_at_secs: 0,
    };
    storage.create_identity(&identity, &key).unwrap();
}

fn message(recipient: u64, sender: Option<u64>, i: u64) -> EncryptedMessage {
    EncryptedMessage {
        recipient: IdentityId(recipient),
        sender: sender.map(IdentityId),
        key_generation: 0,
        ciphertext: vec![i as u8; 16],
        created_at_secs: i,
    }
}

/// Verify that the recipient's log has sequential indices and no gaps
fn verify_log(storage: &impl Storage, recipient: IdentityId) -> Result<u64, StorageError> {
    let Some(latest) = storage.latest_message_index(recipient)? else {
        return Ok(0);
    };

    let messages = storage.load_messages(recipient, 0, (latest + 1) as usize)?;
    for (expected, stored) in messages.iter().enumerate() {
        assert_eq!(stored.id.index, expected as u64);
        assert_eq!(stored.message.created_at_secs, expected as u64);
    }
    assert_eq!(messages.len() as u64, latest + 1);

    Ok(latest + 1)
}

#[test]
fn prop_chaos_appends_never_leave_gaps() {
    proptest!(|(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        attempts in 10usize..100,
    )| {
        let memory = MemoryStorage::new();
        seed_identity(&memory, 1);
        let storage = ChaoticStorage::with_seed(memory, failure_rate, seed);

        // Retry each append until it lands, like the service's caller would.
        let mut next = 0u64;
        for _ in 0..attempts {
            match storage.store_message(IdentityId(1), next, &message(1, None, next)) {
                Ok(()) => next += 1,
                Err(StorageError::Io(_)) => {},
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }

        let stored = verify_log(storage.inner(), IdentityId(1)).unwrap();
        prop_assert_eq!(stored, next);
    });
}

#[test]
fn prop_chaos_rotation_keeps_one_active_key() {
    proptest!(|(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        rotations in 1u32..20,
    )| {
        let memory = MemoryStorage::new();
        seed_identity(&memory, 1);
        let storage = ChaoticStorage::with_seed(memory, failure_rate, seed);

        let mut superseded_at = Vec::new();
        for at in 0..u64::from(rotations) {
            let generation = superseded_at.len() as u32;
            let next = KeyRecord {
                identity_id: IdentityId(1),
                generation: generation + 1,
                public_key_der: vec![1u8; 4],
                custody: Custody::Client,
                status: KeyStatus::Active,
                created_at_secs: at,
            };
            if storage.rotate_key(&next, at).is_ok() {
                superseded_at.push(at);
            }
        }

        let inner = storage.inner();
        let active = inner.active_key(IdentityId(1)).unwrap().unwrap();
        prop_assert_eq!(active.generation as usize, superseded_at.len());

        for (g, at_secs) in superseded_at.iter().enumerate() {
            let record = inner.load_key(IdentityId(1), g as u32).unwrap().unwrap();
            prop_assert_eq!(
                record.status,
                KeyStatus::Superseded { at_secs: *at_secs, by_generation: g as u32 + 1 }
            );
        }
    });
}

#[test]
fn test_redb_under_chaos_matches_successful_writes() {
    let dir = tempdir().unwrap();
    let redb = RedbStorage::open(dir.path().join("chaos.redb")).unwrap();
    seed_identity(&redb, 1);
    seed_identity(&redb, 2);

    let storage = ChaoticStorage::with_seed(redb, 0.3, 0xC0FFEE);

    let mut next = [0u64; 2];
    let mut sent_by_two = 0usize;
    for i in 0..200u64 {
        let recipient = 1 + (i % 2);
        let slot = (recipient - 1) as usize;
        let from_two = recipient == 1 && i % 4 == 0;
        let sender = from_two.then_some(2);

        let msg = message(recipient, sender, next[slot]);
        if storage.store_message(IdentityId(recipient), next[slot], &msg).is_ok() {
            next[slot] += 1;
            if from_two {
                sent_by_two += 1;
            }
        }
    }

    assert_eq!(verify_log(storage.inner(), IdentityId(1)).unwrap(), next[0]);
    assert_eq!(verify_log(storage.inner(), IdentityId(2)).unwrap(), next[1]);
    assert_eq!(storage.inner().load_sent(IdentityId(2), 1000).unwrap().len(), sent_by_two);
}

#[tokio::test]
async fn test_postmaster_accepts_only_what_it_stored() {
    let memory = MemoryStorage::new();
    let config = PostmasterConfig { kdf_iterations: MIN_ITERATIONS, ..Default::default() };
    let gate = || ModerationGate::new(Arc::new(BlocklistClassifier::new()), Default::default());

    // Register against reliable storage, then deliver through a flaky one.
    let reliable = Postmaster::new(SeededEnv::new(1), memory.clone(), gate(), config).unwrap();
    let alice = reliable
        .register(Registration {
            username: "alice".into(),
            display_name: "Alice".into(),
            custody: CustodyChoice::ClientPassphrase("p1".into()),
        })
        .await
        .unwrap();
    let public_key = reliable.public_key("alice").unwrap().public_key;

    let chaotic = ChaoticStorage::with_seed(memory.clone(), 0.25, 99);
    let flaky = Postmaster::new(SeededEnv::new(2), chaotic, gate(), config).unwrap();

    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let mut accepted = 0u64;
    for i in 0..40 {
        let text = format!("note {i}");
        let ciphertext = cipher::encrypt(text.as_bytes(), &public_key, &mut rng).unwrap();
        let submission = Submission {
            recipient: "alice".into(),
            ciphertext: encoding::encode(&ciphertext),
            key_generation: 0,
            screening_text: Some(text),
            sender: None,
        };

        match flaky.submit(submission).await {
            Ok(Delivery::Accepted { message_id }) => {
                assert_eq!(message_id.index, accepted);
                accepted += 1;
            },
            Ok(Delivery::Rejected { reason }) => panic!("unexpected rejection: {reason}"),
            Err(PostmasterError::Storage(StorageError::Io(_)) | PostmasterError::Directory(_)) => {},
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    let stored = memory.load_messages(alice.identity_id, 0, 100).unwrap();
    assert_eq!(stored.len() as u64, accepted);
    assert!(accepted > 0);
}
