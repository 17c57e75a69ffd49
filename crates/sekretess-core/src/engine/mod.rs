//! Crypto engine capability.
//!
//! The engine owns the cryptography (identity generation, prekey agreement,
//! ratcheting, AEAD, sender keys) but none of the state: sessions and sender
//! keys are values handed back to the caller, who caches and persists them.
//! This keeps the cache injectable (one per dispatcher) instead of a
//! process-wide singleton inside the engine.

mod ratchet;
pub mod records;

pub use ratchet::RatchetEngine;

use crate::{
    address::{DistributionId, IdentityKey, LocalIdentity, ProtocolAddress},
    bundle::ConsumerKeyBundle,
    error::{EngineError, KeyAgreementError},
};

/// Cryptographic operations the session lifecycle depends on.
pub trait CryptoEngine: Send + Sync + 'static {
    /// Direct-session state for one remote address
    type Session: Send + 'static;

    /// Broadcast sender-key state for one distribution id
    type SenderKey: Send + 'static;

    /// Generate a fresh identity key pair and registration id.
    fn generate_identity(&self) -> LocalIdentity;

    /// Rebuild an identity from its persisted key pair and registration id.
    fn restore_identity(
        &self,
        key_pair: &[u8],
        registration_id: u32,
    ) -> Result<LocalIdentity, EngineError>;

    /// Establish a session with `remote` from its published key bundle.
    ///
    /// Trust decisions are the caller's; the engine only validates key
    /// material.
    fn establish_session(
        &self,
        local: &LocalIdentity,
        remote: &ProtocolAddress,
        bundle: &ConsumerKeyBundle,
    ) -> Result<Self::Session, KeyAgreementError>;

    /// Check that `key` is a well-formed public identity key.
    ///
    /// Applied to identity keys the server reports outside a key bundle.
    fn validate_identity_key(&self, key: &IdentityKey) -> Result<(), EngineError> {
        if key.as_bytes().is_empty() {
            return Err(EngineError::Encoding("empty identity key".to_string()));
        }
        Ok(())
    }

    /// Identity key of the remote end the session was established with.
    fn session_remote_identity<'a>(&self, session: &'a Self::Session) -> &'a IdentityKey;

    /// Encrypt `plaintext`, advancing the session.
    fn encrypt_session(
        &self,
        session: &mut Self::Session,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError>;

    /// Serialize a session for the session store.
    fn serialize_session(&self, session: &Self::Session) -> Result<Vec<u8>, EngineError>;

    /// Restore a session from the session store.
    fn deserialize_session(&self, bytes: &[u8]) -> Result<Self::Session, EngineError>;

    /// Create a broadcast session for `sender`.
    ///
    /// Returns the sender key and the distribution message consumers need to
    /// decrypt broadcasts encrypted with it.
    fn create_sender_key_session(
        &self,
        sender: &ProtocolAddress,
        distribution_id: DistributionId,
    ) -> Result<(Self::SenderKey, Vec<u8>), EngineError>;

    /// Encrypt a broadcast, advancing the sender key.
    fn encrypt_group(
        &self,
        sender_key: &mut Self::SenderKey,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError>;

    /// Serialize a sender key for the broadcast-session store.
    fn serialize_sender_key(&self, sender_key: &Self::SenderKey) -> Result<Vec<u8>, EngineError>;

    /// Restore a sender key from the broadcast-session store.
    fn deserialize_sender_key(&self, bytes: &[u8]) -> Result<Self::SenderKey, EngineError>;
}
