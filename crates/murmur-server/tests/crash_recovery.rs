//! Crash recovery tests for `RedbStorage`.
//!
//! Identities, key generations and message logs must survive a close/reopen
//! cycle, simulating a server restart.

use std::sync::Arc;

use murmur_core::{
    BlocklistClassifier, Custody, EncryptedMessage, Identity, IdentityId, KeyRecord, KeyStatus,
    ModerationGate, Submission, env::SeededEnv, open_all,
};
use murmur_crypto::{DeploymentSecret, KeyCustodyService, cipher, encoding, kdf::MIN_ITERATIONS};
use murmur_server::{
    CustodyChoice, Delivery, Postmaster, PostmasterConfig, RedbStorage, Registration, Storage,
    StorageError,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tempfile::tempdir;

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
        public_key_der: vec![generation as u8; 8],
        custody: Custody::Client,
        status: KeyStatus::Active,
        created_at_secs: 10 + u64::from(generation),
    }
}

fn message(recipient: u64, index: u64) -> EncryptedMessage {
    EncryptedMessage {
        recipient: IdentityId(recipient),
        sender: None,
        key_generation: 0,
        ciphertext: vec![index as u8; 256],
        created_at_secs: 100 + index,
    }
}

#[test]
fn test_messages_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");
    let count = 10u64;

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();

        for i in 0..count {
            storage.store_message(IdentityId(1), i, &message(1, i)).unwrap();
        }
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();

        assert_eq!(storage.latest_message_index(IdentityId(1)).unwrap(), Some(count - 1));

        let messages = storage.load_messages(IdentityId(1), 0, count as usize + 10).unwrap();
        assert_eq!(messages.len(), count as usize);
        for (i, stored) in messages.iter().enumerate() {
            assert_eq!(stored.id.index, i as u64);
            assert_eq!(stored.message, message(1, i as u64));
        }
    }
}

#[test]
fn test_rotation_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();
        storage.rotate_key(&key(1, 1), 500).unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();

        let active = storage.active_key(IdentityId(1)).unwrap().unwrap();
        assert_eq!(active.generation, 1);

        let old = storage.load_key(IdentityId(1), 0).unwrap().unwrap();
        assert_eq!(old.status, KeyStatus::Superseded { at_secs: 500, by_generation: 1 });

        // The active index moved with the rotation; a stale rotation conflicts.
        let stale = storage.rotate_key(&key(1, 1), 600);
        assert!(matches!(stale, Err(StorageError::Conflict { .. })));
    }
}

#[test]
fn test_append_continues_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();
        storage.store_message(IdentityId(1), 0, &message(1, 0)).unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();

        let result = storage.store_message(IdentityId(1), 0, &message(1, 0));
        assert_eq!(result, Err(StorageError::Conflict { expected: 1, got: 0 }));

        storage.store_message(IdentityId(1), 1, &message(1, 1)).unwrap();
        assert_eq!(storage.latest_message_index(IdentityId(1)).unwrap(), Some(1));
    }
}

#[test]
fn test_username_index_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.create_identity(&identity(1, "alice"), &key(1, 0)).unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        assert_eq!(storage.find_identity("alice").unwrap(), Some(identity(1, "alice")));

        let duplicate = storage.create_identity(&identity(2, "alice"), &key(2, 0));
        assert_eq!(duplicate, Err(StorageError::UsernameTaken("alice".into())));
    }
}

#[tokio::test]
async fn test_custodied_inbox_readable_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");
    let secret = DeploymentSecret::from_bytes([3u8; 32]);

    let open = |env: SeededEnv| {
        let gate = ModerationGate::new(Arc::new(BlocklistClassifier::new()), Default::default());
        let config = PostmasterConfig { kdf_iterations: MIN_ITERATIONS, ..Default::default() };
        Postmaster::new(env, RedbStorage::open(&db_path).unwrap(), gate, config)
            .unwrap()
            .with_custody(KeyCustodyService::new(&secret).unwrap())
    };

    let alice = {
        let pm = open(SeededEnv::new(1));
        let receipt = pm
            .register(Registration {
                username: "alice".into(),
                display_name: "Alice".into(),
                custody: CustodyChoice::Server,
            })
            .await
            .unwrap();

        let entry = pm.public_key("alice").unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let ciphertext = cipher::encrypt(b"see you tomorrow", &entry.public_key, &mut rng).unwrap();

        let delivery = pm
            .submit(Submission {
                recipient: "alice".into(),
                ciphertext: encoding::encode(&ciphertext),
                key_generation: entry.generation,
                screening_text: Some("see you tomorrow".into()),
                sender: None,
            })
            .await
            .unwrap();
        assert!(matches!(delivery, Delivery::Accepted { .. }));

        receipt.identity_id
    };

    let pm = open(SeededEnv::new(2));
    let keyring = pm.unlock_custodied(alice).unwrap();
    let opened = open_all(&pm.inbox(alice, 0, 10).unwrap(), &keyring);

    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].body.as_deref(), Ok("see you tomorrow"));
}
