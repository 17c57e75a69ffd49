//! Fuzz target for consumer key bundle parsing
//!
//! The key bundle is the only structured input the business accepts from the
//! server before a session exists.
//!
//! # Strategy
//!
//! - Raw JSON: arbitrary bytes through the wire deserializer
//! - Fields: arbitrary strings in every base64 and id field
//!
//! # Invariants
//!
//! - Parsing returns `Ok` or `PrekeyBundleError`, NEVER panics
//! - A parsed bundle echoes the username it was built from

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sekretess_core::{ConsumerKeyBundle, ConsumerKeysResponse};

#[derive(Debug, Arbitrary)]
enum Input {
    Json(Vec<u8>),
    Fields {
        username: String,
        ik: String,
        opk: String,
        reg_id: u32,
        spk: String,
        spk_id: String,
        spk_signature: String,
        pq_spk: String,
        pq_spk_id: String,
        pq_spk_signature: String,
    },
}

fuzz_target!(|input: Input| {
    let response = match input {
        Input::Json(bytes) => match serde_json::from_slice::<ConsumerKeysResponse>(&bytes) {
            Ok(response) => response,
            Err(_) => return,
        },
        Input::Fields {
            username,
            ik,
            opk,
            reg_id,
            spk,
            spk_id,
            spk_signature,
            pq_spk,
            pq_spk_id,
            pq_spk_signature,
        } => ConsumerKeysResponse {
            username,
            ik,
            opk,
            reg_id,
            spk,
            spk_id,
            spk_signature,
            pq_spk,
            pq_spk_id,
            pq_spk_signature,
        },
    };

    if let Ok(bundle) = ConsumerKeyBundle::try_from(&response) {
        assert_eq!(bundle.consumer, response.username);
    }
});
