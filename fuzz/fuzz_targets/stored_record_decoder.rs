//! Fuzz target for persisted record decoding
//!
//! Durable storage is outside the process and may hold torn or foreign
//! records after a crash.
//!
//! # Strategy
//!
//! - Session records, sender-key records and identity key pairs decoded
//!   from arbitrary bytes
//! - Records that decode are re-encoded and decoded again
//!
//! # Invariants
//!
//! - Decoding returns `Ok` or `EngineError`, NEVER panics
//! - A decoded record survives a second encode/decode

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sekretess_core::{CryptoEngine, RatchetEngine, SystemEnv};

#[derive(Debug, Arbitrary)]
enum Record {
    Session(Vec<u8>),
    SenderKey(Vec<u8>),
    Identity { key_pair: Vec<u8>, registration_id: u32 },
}

fuzz_target!(|record: Record| {
    let engine = RatchetEngine::new(SystemEnv);

    match record {
        Record::Session(bytes) => {
            if let Ok(session) = engine.deserialize_session(&bytes) {
                let encoded = engine.serialize_session(&session).unwrap();
                assert!(engine.deserialize_session(&encoded).is_ok());
            }
        },
        Record::SenderKey(bytes) => {
            if let Ok(sender_key) = engine.deserialize_sender_key(&bytes) {
                let encoded = engine.serialize_sender_key(&sender_key).unwrap();
                assert!(engine.deserialize_sender_key(&encoded).is_ok());
            }
        },
        Record::Identity { key_pair, registration_id } => {
            if let Ok(identity) = engine.restore_identity(&key_pair, registration_id) {
                assert_eq!(identity.registration_id(), registration_id);
            }
        },
    }
});
