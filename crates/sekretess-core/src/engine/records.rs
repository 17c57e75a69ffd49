//! CBOR records produced by [`RatchetEngine`](super::RatchetEngine).
//!
//! Session and sender-key records are what the bridge persists; the message
//! types are what consumers receive. Consumers use them together with
//! `sekretess_crypto::respond` and `sekretess_crypto::open`.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    address::{DistributionId, IdentityKey},
    error::EngineError,
};

/// What a consumer needs to derive the session secrets.
///
/// Carried on every direct message: the business never learns when the
/// consumer has processed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyHeader {
    /// Business identity key
    pub sender_identity: Vec<u8>,
    /// Business registration id
    pub registration_id: u32,
    /// Ephemeral X25519 public key
    pub ephemeral_public: [u8; 32],
    /// Business signature over `ephemeral_public || consumer identity`
    pub ephemeral_signature: Vec<u8>,
    /// Signed prekey the business used
    pub signed_prekey_id: u32,
    /// One-time prekey the business used
    pub one_time_prekey_id: u32,
    /// Post-quantum prekey the business bound
    pub pq_prekey_id: u32,
}

/// Persisted direct-session state.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Consumer identity the session was established with
    pub remote_identity: IdentityKey,
    /// Consumer registration id
    pub remote_registration_id: u32,
    /// Channel id bound into every nonce
    pub channel_id: [u8; 16],
    /// Current chain key
    pub chain_key: [u8; 32],
    /// Next generation to encrypt with
    pub generation: u32,
    /// Header attached to every message
    pub header: PreKeyHeader,
}

/// An encrypted direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Session setup header
    pub header: PreKeyHeader,
    /// Ratchet generation
    pub generation: u32,
    /// AEAD nonce
    pub nonce: [u8; 24],
    /// AEAD ciphertext
    pub ciphertext: Vec<u8>,
}

/// Persisted broadcast sender-key state.
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    /// Distribution id (also the broadcast channel id)
    pub distribution_id: DistributionId,
    /// Current chain key
    pub chain_key: [u8; 32],
    /// Next generation to encrypt with
    pub generation: u32,
    /// Ed25519 seed signing every broadcast
    pub signing_seed: [u8; 32],
}

/// Credential a consumer needs to decrypt broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionMessage {
    /// Distribution id of the broadcast session
    pub distribution_id: DistributionId,
    /// Generation `chain_key` belongs to
    pub generation: u32,
    /// Chain key at `generation`
    pub chain_key: [u8; 32],
    /// Ed25519 public key verifying every broadcast
    pub signing_key: [u8; 32],
}

/// An encrypted, signed broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Distribution id of the broadcast session
    pub distribution_id: DistributionId,
    /// Ratchet generation
    pub generation: u32,
    /// AEAD nonce
    pub nonce: [u8; 24],
    /// AEAD ciphertext
    pub ciphertext: Vec<u8>,
    /// Sender signature over [`GroupMessage::signed_bytes`]
    pub signature: Vec<u8>,
}

impl GroupMessage {
    /// Bytes covered by the sender signature.
    ///
    /// Layout: [distribution id: 16][generation: 4 BE][nonce: 24][ciphertext]
    pub fn signed_bytes(
        distribution_id: &DistributionId,
        generation: u32,
        nonce: &[u8; 24],
        ciphertext: &[u8],
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(44 + ciphertext.len());
        bytes.extend_from_slice(distribution_id.as_bytes());
        bytes.extend_from_slice(&generation.to_be_bytes());
        bytes.extend_from_slice(nonce);
        bytes.extend_from_slice(ciphertext);
        bytes
    }
}

/// Associated data of a direct message: sender identity || recipient identity.
pub fn direct_aad(sender_identity: &[u8], recipient_identity: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(sender_identity.len() + recipient_identity.len());
    aad.extend_from_slice(sender_identity);
    aad.extend_from_slice(recipient_identity);
    aad
}

/// Encode a record as CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| EngineError::Encoding(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR record.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    ciborium::from_reader(bytes).map_err(|e| EngineError::Encoding(e.to_string()))
}
