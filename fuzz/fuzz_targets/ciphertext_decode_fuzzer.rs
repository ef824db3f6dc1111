//! Fuzz target for submission input parsing
//!
//! Everything a sender controls passes through here before moderation:
//! the base64 ciphertext, a pasted public key and the classifier's reply.
//!
//! # Invariants
//!
//! - No parser panics on arbitrary text
//! - An accepted ciphertext is exactly one RSA block
//! - Lenient base64 decoding is stable under re-encoding

#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur_core::{MessageError, message::decode_ciphertext, moderation::parse_verdict};
use murmur_crypto::{PublicKey, encoding};

const MODULUS_SIZE: usize = 256;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    match decode_ciphertext(&text, MODULUS_SIZE) {
        Ok(bytes) => assert_eq!(bytes.len(), MODULUS_SIZE),
        Err(MessageError::CiphertextLength { expected, got }) => {
            assert_eq!(expected, MODULUS_SIZE);
            assert_ne!(got, MODULUS_SIZE);
        },
        Err(_) => {},
    }

    if let Some(bytes) = encoding::decode(&text) {
        assert_eq!(encoding::decode(&encoding::encode(&bytes)), Some(bytes));
    }

    let _ = PublicKey::from_base64(&text);
    let _ = parse_verdict(&text);
});
