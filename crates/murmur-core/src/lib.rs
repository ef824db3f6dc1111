//! Murmur core domain logic
//!
//! Sans-IO building blocks shared by the server and the CLI: identities and
//! their key generations, encrypted message records, the moderation gate and
//! inbox opening. Nothing here touches the network or disk; time and
//! randomness come from an [`env::Environment`].
//!
//! # Message flow
//!
//! ```text
//! sender ── encrypt(recipient public key) ──► Submission
//!                                               │
//!                     decode_ciphertext ◄───────┤ validate length
//!                     ModerationGate::screen ◄──┤ Admit / Reject
//!                                               ▼
//!                                        EncryptedMessage (persisted)
//!                                               │
//! recipient ◄── inbox::open_all(Keyring) ◄──────┘
//! ```

pub mod blocklist;
pub mod env;
pub mod identity;
pub mod inbox;
pub mod message;
pub mod moderation;

pub use blocklist::BlocklistClassifier;
pub use env::{EnvRng, Environment};
pub use identity::{Custody, Identity, IdentityError, IdentityId, KeyRecord, KeyStatus};
pub use inbox::{Keyring, OpenedMessage, ReadFailure, open_all};
pub use message::{EncryptedMessage, MessageError, MessageId, StoredMessage, Submission};
pub use moderation::{
    Classification, Classifier, ClassifierError, FailurePolicy, ModerationConfig, ModerationGate,
    ModerationOutcome, RejectReason, Verdict,
};
