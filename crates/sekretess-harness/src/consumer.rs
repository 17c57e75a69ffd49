//! Simulated consumer device.
//!
//! Publishes a key bundle the way a consumer app would and decrypts what the
//! business sends: direct messages, key-distribution messages and broadcasts.

use std::collections::{HashMap, hash_map::Entry};

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use sekretess_core::{
    ConsumerKeysResponse, DistributionId, Environment, IdentityKey, MessageType,
    engine::records::{DirectMessage, DistributionMessage, GroupMessage, direct_aad, from_cbor},
};
use sekretess_crypto::{
    CryptoError, PreKeyPair, ResponderKeys, SealedPayload, SigningKeyPair, SymmetricRatchet, open,
    respond, verify_signature,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::test_env::TestEnv;

const SIGNED_PREKEY_ID: u32 = 1;
const PQ_PREKEY_ID: u32 = 2;
const ONE_TIME_PREKEY_ID: u32 = 3;

/// Errors decrypting what the business sent.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Payload was not valid base64 or CBOR
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Message was addressed to a previous identity or prekey
    #[error("unknown prekey {0}")]
    UnknownPrekey(u32),

    /// Broadcast for a distribution id never received
    #[error("no distribution message for {0}")]
    UnknownDistribution(DistributionId),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// What a consumer got out of one delivered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Application text
    Text(Vec<u8>),
    /// A distribution message was installed
    Distribution(DistributionId),
}

struct Keys {
    identity: SigningKeyPair,
    signed_prekey: PreKeyPair,
    one_time_prekey: PreKeyPair,
    pq_prekey: Vec<u8>,
    registration_id: u32,
}

impl Keys {
    fn generate(env: &TestEnv) -> Self {
        let mut pq_prekey = vec![0u8; 64];
        env.random_bytes(&mut pq_prekey);
        Self {
            identity: SigningKeyPair::from_seed(&env.random_seed()),
            signed_prekey: PreKeyPair::from_seed(env.random_seed()),
            one_time_prekey: PreKeyPair::from_seed(env.random_seed()),
            pq_prekey,
            registration_id: env.random_u32() % 16380 + 1,
        }
    }
}

struct Broadcast {
    ratchet: SymmetricRatchet,
    signing_key: [u8; 32],
}

/// A consumer app with one device.
pub struct ConsumerDevice {
    name: String,
    keys: Keys,
    /// Receiving ratchets keyed by the business ephemeral key
    sessions: HashMap<[u8; 32], SymmetricRatchet>,
    broadcasts: HashMap<DistributionId, Broadcast>,
}

impl ConsumerDevice {
    /// Create a consumer with fresh keys drawn from `env`.
    pub fn new(name: impl Into<String>, env: &TestEnv) -> Self {
        Self {
            name: name.into(),
            keys: Keys::generate(env),
            sessions: HashMap::new(),
            broadcasts: HashMap::new(),
        }
    }

    /// Consumer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current identity key.
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.keys.identity.public_key().to_vec())
    }

    /// Current identity key, base64 as the server reports it.
    pub fn identity_key_b64(&self) -> String {
        B64.encode(self.keys.identity.public_key())
    }

    /// Reinstall: new identity and prekeys, all sessions forgotten.
    ///
    /// Installed distribution messages survive.
    pub fn rotate(&mut self, env: &TestEnv) {
        self.keys = Keys::generate(env);
        self.sessions.clear();
    }

    /// The key bundle as the server returns it.
    pub fn keys_response(&self) -> ConsumerKeysResponse {
        let keys = &self.keys;
        let spk = keys.signed_prekey.public_key();
        ConsumerKeysResponse {
            username: self.name.clone(),
            ik: B64.encode(keys.identity.public_key()),
            opk: format!(
                "{ONE_TIME_PREKEY_ID}:{}",
                B64.encode(keys.one_time_prekey.public_key())
            ),
            reg_id: keys.registration_id,
            spk: B64.encode(spk),
            spk_id: SIGNED_PREKEY_ID.to_string(),
            spk_signature: B64.encode(keys.identity.sign(&spk)),
            pq_spk: B64.encode(&keys.pq_prekey),
            pq_spk_id: PQ_PREKEY_ID.to_string(),
            pq_spk_signature: B64.encode(keys.identity.sign(&keys.pq_prekey)),
        }
    }

    /// Decrypt a delivered direct message of `message_type`.
    ///
    /// A `KEY_DIST` message installs the distribution message it carries.
    pub fn receive(
        &mut self,
        ciphertext_b64: &str,
        message_type: MessageType,
    ) -> Result<Received, ConsumerError> {
        let plaintext = self.decrypt_direct(ciphertext_b64)?;
        match message_type {
            MessageType::Private => Ok(Received::Text(plaintext)),
            MessageType::KeyDist => {
                let encoded = String::from_utf8(plaintext)
                    .map_err(|e| ConsumerError::Malformed(e.to_string()))?;
                self.install_distribution(&decode_b64(&encoded)?)
            },
        }
    }

    /// Install a raw distribution message.
    pub fn install_distribution(&mut self, bytes: &[u8]) -> Result<Received, ConsumerError> {
        let message: DistributionMessage = decode_cbor(bytes)?;
        let id = message.distribution_id;
        self.broadcasts.insert(
            id,
            Broadcast {
                ratchet: SymmetricRatchet::from_parts(message.chain_key, message.generation),
                signing_key: message.signing_key,
            },
        );
        debug!(consumer = %self.name, distribution_id = %id, "installed distribution message");
        Ok(Received::Distribution(id))
    }

    /// Whether a distribution message for `id` is installed.
    pub fn has_distribution(&self, id: DistributionId) -> bool {
        self.broadcasts.contains_key(&id)
    }

    /// Decrypt a broadcast.
    pub fn receive_broadcast(&mut self, ciphertext_b64: &str) -> Result<Vec<u8>, ConsumerError> {
        let message: GroupMessage = decode_cbor(&decode_b64(ciphertext_b64)?)?;
        let broadcast = self
            .broadcasts
            .get_mut(&message.distribution_id)
            .ok_or(ConsumerError::UnknownDistribution(message.distribution_id))?;

        verify_signature(
            &broadcast.signing_key,
            &GroupMessage::signed_bytes(
                &message.distribution_id,
                message.generation,
                &message.nonce,
                &message.ciphertext,
            ),
            &message.signature,
            "broadcast",
        )?;

        let key = broadcast.ratchet.advance_to(message.generation)?;
        let sealed = SealedPayload {
            generation: message.generation,
            nonce: message.nonce,
            ciphertext: message.ciphertext,
        };
        Ok(open(&sealed, &key, &[])?)
    }

    fn decrypt_direct(&mut self, ciphertext_b64: &str) -> Result<Vec<u8>, ConsumerError> {
        let message: DirectMessage = decode_cbor(&decode_b64(ciphertext_b64)?)?;
        let header = &message.header;

        let ratchet = match self.sessions.entry(header.ephemeral_public) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if header.one_time_prekey_id != ONE_TIME_PREKEY_ID {
                    return Err(ConsumerError::UnknownPrekey(header.one_time_prekey_id));
                }
                let secrets = respond(
                    &ResponderKeys {
                        identity: &self.keys.identity,
                        signed_prekey: &self.keys.signed_prekey,
                        one_time_prekey: Some(&self.keys.one_time_prekey),
                        pq_prekey: &self.keys.pq_prekey,
                    },
                    &header.sender_identity,
                    &header.ephemeral_public,
                    &header.ephemeral_signature,
                )?;
                entry.insert(SymmetricRatchet::new(&secrets.chain_seed))
            },
        };
        let key = ratchet.advance_to(message.generation)?;

        let aad = direct_aad(&header.sender_identity, &self.keys.identity.public_key());
        let sealed = SealedPayload {
            generation: message.generation,
            nonce: message.nonce,
            ciphertext: message.ciphertext,
        };
        Ok(open(&sealed, &key, &aad)?)
    }
}

fn decode_b64(text: &str) -> Result<Vec<u8>, ConsumerError> {
    B64.decode(text).map_err(|e| ConsumerError::Malformed(e.to_string()))
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ConsumerError> {
    from_cbor(bytes).map_err(|e| ConsumerError::Malformed(e.to_string()))
}
