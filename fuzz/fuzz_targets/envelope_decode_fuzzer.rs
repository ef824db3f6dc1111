//! Fuzz target for WrappedKey JSON decoding
//!
//! Envelopes arrive from browsers, key store files and the database, so the
//! parser sees current and legacy layouts as well as garbage.
//!
//! # Invariants
//!
//! - Decoding NEVER panics; invalid input is `InvalidEnvelope`
//! - Anything that decodes re-encodes to an equal envelope
//! - Opening with an unrelated key fails cleanly

#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur_crypto::{SymmetricKey, WrappedKey};

fuzz_target!(|data: &[u8]| {
    let Ok(json) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(envelope) = WrappedKey::from_json(json) else {
        return;
    };

    let reparsed = WrappedKey::from_json(&envelope.to_json()).expect("re-encoded envelope parses");
    assert_eq!(reparsed, envelope);

    // Passphrase envelopes carry their own KDF parameters; they stay in bounds.
    if let Some(params) = envelope.kdf_params() {
        assert!(params.iterations() >= murmur_crypto::kdf::MIN_ITERATIONS);
        assert!(params.iterations() <= murmur_crypto::kdf::MAX_ITERATIONS);
    }

    let _ = envelope.open(&SymmetricKey::from_bytes([0u8; 32]));
});
