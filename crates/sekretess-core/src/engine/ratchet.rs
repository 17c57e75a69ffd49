//! Reference crypto engine built on `sekretess-crypto`.

use sekretess_crypto::{
    CryptoError, NONCE_RANDOM_SIZE, PUBLIC_KEY_LEN, RemotePrekeys, SigningKeyPair,
    SymmetricRatchet, initiate, seal,
};
use tracing::debug;

use super::{
    CryptoEngine,
    records::{
        DirectMessage, DistributionMessage, GroupMessage, PreKeyHeader, SenderKeyState,
        SessionState, direct_aad, from_cbor, to_cbor,
    },
};
use crate::{
    address::{DistributionId, IdentityKey, LocalIdentity, ProtocolAddress},
    bundle::ConsumerKeyBundle,
    env::Environment,
    error::{EngineError, KeyAgreementError},
};

/// Registration ids are drawn from `1..=MAX_REGISTRATION_ID`.
const MAX_REGISTRATION_ID: u32 = 16380;

/// [`CryptoEngine`] using Ed25519 identities, X25519 prekey agreement, an
/// HMAC-SHA256 ratchet and XChaCha20-Poly1305.
///
/// Randomness comes from `V`, so a seeded environment makes every key and
/// nonce reproducible.
#[derive(Clone)]
pub struct RatchetEngine<V: Environment> {
    env: V,
}

impl<V: Environment> RatchetEngine<V> {
    /// Create an engine drawing randomness from `env`.
    pub fn new(env: V) -> Self {
        Self { env }
    }

    fn nonce_suffix(&self) -> [u8; NONCE_RANDOM_SIZE] {
        let mut suffix = [0u8; NONCE_RANDOM_SIZE];
        self.env.random_bytes(&mut suffix);
        suffix
    }
}

impl<V: Environment> CryptoEngine for RatchetEngine<V> {
    type Session = SessionState;
    type SenderKey = SenderKeyState;

    fn generate_identity(&self) -> LocalIdentity {
        let pair = SigningKeyPair::from_seed(&self.env.random_seed());
        let registration_id = self.env.random_u32() % MAX_REGISTRATION_ID + 1;

        LocalIdentity::new(
            IdentityKey::new(pair.public_key().to_vec()),
            pair.to_bytes().to_vec(),
            registration_id,
        )
    }

    fn restore_identity(
        &self,
        key_pair: &[u8],
        registration_id: u32,
    ) -> Result<LocalIdentity, EngineError> {
        let pair =
            SigningKeyPair::from_bytes(key_pair).map_err(|e| EngineError::Encoding(e.to_string()))?;

        Ok(LocalIdentity::new(
            IdentityKey::new(pair.public_key().to_vec()),
            key_pair.to_vec(),
            registration_id,
        ))
    }

    fn validate_identity_key(&self, key: &IdentityKey) -> Result<(), EngineError> {
        let len = key.as_bytes().len();
        if len != PUBLIC_KEY_LEN {
            return Err(EngineError::Encoding(format!(
                "identity key must be {PUBLIC_KEY_LEN} bytes, got {len}"
            )));
        }
        Ok(())
    }

    fn establish_session(
        &self,
        local: &LocalIdentity,
        remote: &ProtocolAddress,
        bundle: &ConsumerKeyBundle,
    ) -> Result<SessionState, KeyAgreementError> {
        let pair = SigningKeyPair::from_bytes(local.key_pair())
            .map_err(|e| KeyAgreementError::InvalidKey(format!("local identity: {e}")))?;

        let prekeys = RemotePrekeys {
            identity_key: bundle.identity_key.as_bytes(),
            signed_prekey: &bundle.signed_prekey.public_key,
            signed_prekey_signature: &bundle.signed_prekey.signature,
            one_time_prekey: Some(&bundle.one_time_prekey.public_key),
            pq_prekey: &bundle.pq_prekey.public_key,
            pq_prekey_signature: &bundle.pq_prekey.signature,
        };
        let initiation =
            initiate(&pair, &prekeys, self.env.random_seed()).map_err(agreement_error)?;

        debug!(%remote, generation = 0, "prekey agreement complete");

        Ok(SessionState {
            remote_identity: bundle.identity_key.clone(),
            remote_registration_id: bundle.registration_id,
            channel_id: initiation.secrets.channel_id,
            chain_key: initiation.secrets.chain_seed,
            generation: 0,
            header: PreKeyHeader {
                sender_identity: local.identity_key().as_bytes().to_vec(),
                registration_id: local.registration_id(),
                ephemeral_public: initiation.ephemeral_public,
                ephemeral_signature: initiation.ephemeral_signature.to_vec(),
                signed_prekey_id: bundle.signed_prekey.id,
                one_time_prekey_id: bundle.one_time_prekey.id,
                pq_prekey_id: bundle.pq_prekey.id,
            },
        })
    }

    fn session_remote_identity<'a>(&self, session: &'a SessionState) -> &'a IdentityKey {
        &session.remote_identity
    }

    fn encrypt_session(
        &self,
        session: &mut SessionState,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let mut ratchet = SymmetricRatchet::from_parts(session.chain_key, session.generation);
        let message_key = ratchet.advance().map_err(|e| EngineError::Crypto(e.to_string()))?;

        let aad = direct_aad(&session.header.sender_identity, session.remote_identity.as_bytes());
        let sealed =
            seal(plaintext, &message_key, &session.channel_id, &aad, self.nonce_suffix());

        let message = DirectMessage {
            header: session.header.clone(),
            generation: sealed.generation,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        };
        let encoded = to_cbor(&message)?;

        session.chain_key = *ratchet.chain_key();
        session.generation = ratchet.generation();
        Ok(encoded)
    }

    fn serialize_session(&self, session: &SessionState) -> Result<Vec<u8>, EngineError> {
        to_cbor(session)
    }

    fn deserialize_session(&self, bytes: &[u8]) -> Result<SessionState, EngineError> {
        from_cbor(bytes)
    }

    fn create_sender_key_session(
        &self,
        sender: &ProtocolAddress,
        distribution_id: DistributionId,
    ) -> Result<(SenderKeyState, Vec<u8>), EngineError> {
        let state = SenderKeyState {
            distribution_id,
            chain_key: self.env.random_seed(),
            generation: 0,
            signing_seed: self.env.random_seed(),
        };
        let distribution = DistributionMessage {
            distribution_id,
            generation: state.generation,
            chain_key: state.chain_key,
            signing_key: SigningKeyPair::from_seed(&state.signing_seed).public_key(),
        };

        debug!(%sender, %distribution_id, "created sender key");

        Ok((state, to_cbor(&distribution)?))
    }

    fn encrypt_group(
        &self,
        sender_key: &mut SenderKeyState,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let mut ratchet = SymmetricRatchet::from_parts(sender_key.chain_key, sender_key.generation);
        let message_key = ratchet.advance().map_err(|e| EngineError::Crypto(e.to_string()))?;

        let channel = sender_key.distribution_id.as_bytes();
        let sealed = seal(plaintext, &message_key, channel, &[], self.nonce_suffix());

        let signer = SigningKeyPair::from_seed(&sender_key.signing_seed);
        let signature = signer.sign(&GroupMessage::signed_bytes(
            &sender_key.distribution_id,
            sealed.generation,
            &sealed.nonce,
            &sealed.ciphertext,
        ));

        let message = GroupMessage {
            distribution_id: sender_key.distribution_id,
            generation: sealed.generation,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            signature: signature.to_vec(),
        };
        let encoded = to_cbor(&message)?;

        sender_key.chain_key = *ratchet.chain_key();
        sender_key.generation = ratchet.generation();
        Ok(encoded)
    }

    fn serialize_sender_key(&self, sender_key: &SenderKeyState) -> Result<Vec<u8>, EngineError> {
        to_cbor(sender_key)
    }

    fn deserialize_sender_key(&self, bytes: &[u8]) -> Result<SenderKeyState, EngineError> {
        from_cbor(bytes)
    }
}

fn agreement_error(error: CryptoError) -> KeyAgreementError {
    match error {
        CryptoError::InvalidSignature { kind } => {
            KeyAgreementError::InvalidSignature(kind.to_string())
        },
        CryptoError::NonContributory => KeyAgreementError::NonContributory,
        other => KeyAgreementError::InvalidKey(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    };

    use super::*;
    use crate::bundle::{PreKey, SignedPreKey};

    /// Counter-based environment; every call returns distinct bytes.
    #[derive(Clone, Default)]
    struct CountingEnv(Arc<AtomicU8>);

    impl Environment for CountingEnv {
        fn random_bytes(&self, buffer: &mut [u8]) {
            let next = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            buffer.fill(next);
        }

        fn wall_clock_secs(&self) -> u64 {
            0
        }
    }

    fn bundle_for(consumer: &SigningKeyPair) -> ConsumerKeyBundle {
        let spk = sekretess_crypto::PreKeyPair::from_seed([40u8; 32]).public_key();
        let opk = sekretess_crypto::PreKeyPair::from_seed([41u8; 32]).public_key();
        let pq = vec![42u8; 64];

        ConsumerKeyBundle {
            consumer: "alice".to_string(),
            registration_id: 77,
            identity_key: IdentityKey::new(consumer.public_key().to_vec()),
            one_time_prekey: PreKey { id: 3, public_key: opk.to_vec() },
            signed_prekey: SignedPreKey {
                id: 1,
                public_key: spk.to_vec(),
                signature: consumer.sign(&spk).to_vec(),
            },
            pq_prekey: SignedPreKey {
                id: 2,
                signature: consumer.sign(&pq).to_vec(),
                public_key: pq,
            },
        }
    }

    #[test]
    fn registration_id_is_in_range() {
        let engine = RatchetEngine::new(CountingEnv::default());
        for _ in 0..50 {
            let id = engine.generate_identity().registration_id();
            assert!((1..=MAX_REGISTRATION_ID).contains(&id));
        }
    }

    #[test]
    fn restored_identity_has_same_public_key() {
        let engine = RatchetEngine::new(CountingEnv::default());
        let identity = engine.generate_identity();

        let restored =
            engine.restore_identity(identity.key_pair(), identity.registration_id()).unwrap();
        assert_eq!(restored.identity_key(), identity.identity_key());
        assert!(engine.restore_identity(&[1, 2, 3], 1).is_err());
    }

    #[test]
    fn identity_key_must_be_a_public_key() {
        let engine = RatchetEngine::new(CountingEnv::default());
        let identity = engine.generate_identity();

        assert!(engine.validate_identity_key(identity.identity_key()).is_ok());
        assert!(engine.validate_identity_key(&IdentityKey::new(Vec::new())).is_err());
        assert!(engine.validate_identity_key(&IdentityKey::new(vec![5; 33])).is_err());
    }

    #[test]
    fn session_advances_and_survives_serialization() {
        let engine = RatchetEngine::new(CountingEnv::default());
        let local = engine.generate_identity();
        let consumer = SigningKeyPair::from_seed(&[9u8; 32]);
        let address = ProtocolAddress::new("alice", 123);

        let mut session =
            engine.establish_session(&local, &address, &bundle_for(&consumer)).unwrap();
        assert_eq!(engine.session_remote_identity(&session).as_bytes(), consumer.public_key());

        let first: DirectMessage =
            from_cbor(&engine.encrypt_session(&mut session, b"hi").unwrap()).unwrap();
        let mut restored =
            engine.deserialize_session(&engine.serialize_session(&session).unwrap()).unwrap();
        let second: DirectMessage =
            from_cbor(&engine.encrypt_session(&mut restored, b"again").unwrap()).unwrap();

        assert_eq!(first.generation, 0);
        assert_eq!(second.generation, 1);
        assert_eq!(second.header, first.header);
    }

    #[test]
    fn forged_prekey_signature_fails_agreement() {
        let engine = RatchetEngine::new(CountingEnv::default());
        let local = engine.generate_identity();
        let consumer = SigningKeyPair::from_seed(&[9u8; 32]);
        let mut bundle = bundle_for(&consumer);
        bundle.signed_prekey.signature = vec![0u8; 64];

        let result = engine.establish_session(&local, &ProtocolAddress::new("alice", 123), &bundle);
        assert!(matches!(result, Err(KeyAgreementError::InvalidSignature(_))));
    }

    #[test]
    fn group_messages_are_signed_with_distributed_key() {
        let engine = RatchetEngine::new(CountingEnv::default());
        let id = DistributionId::from_random_bytes([5u8; 16]);

        let (mut sender_key, distribution) =
            engine.create_sender_key_session(&ProtocolAddress::new("acme", 1), id).unwrap();
        let distribution: DistributionMessage = from_cbor(&distribution).unwrap();
        let message: GroupMessage =
            from_cbor(&engine.encrypt_group(&mut sender_key, b"promo").unwrap()).unwrap();

        assert_eq!(distribution.distribution_id, id);
        assert_eq!(message.generation, 0);
        assert_eq!(sender_key.generation, 1);
        sekretess_crypto::verify_signature(
            &distribution.signing_key,
            &GroupMessage::signed_bytes(
                &id,
                message.generation,
                &message.nonce,
                &message.ciphertext,
            ),
            &message.signature,
            "broadcast",
        )
        .unwrap();
    }
}
