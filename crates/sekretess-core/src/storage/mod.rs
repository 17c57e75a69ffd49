//! Persistence contracts for identities, sessions and the broadcast session.
//!
//! Three independent synchronous key-value contracts. Record payloads are
//! opaque blobs produced by the crypto engine; storage never interprets them.
//!
//! # Broadcast session halves
//!
//! A broadcast session is written in two halves (sender-key record and
//! distribution message). Each write preserves the other half when it refers
//! to the same distribution id. A write carrying a different distribution id
//! replaces the record and drops the stale half, so the two halves can never
//! reference different ids.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::sync::Arc;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;
use crate::address::DistributionId;

/// Persisted business identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    /// Opaque serialized key pair
    pub key_pair: Vec<u8>,
    /// Registration id
    pub registration_id: u32,
}

impl std::fmt::Debug for StoredIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredIdentity")
            .field("registration_id", &self.registration_id)
            .finish_non_exhaustive()
    }
}

/// Persisted direct session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Consumer name
    pub name: String,
    /// Consumer device id
    pub device_id: u32,
    /// Opaque serialized session state
    pub record: Vec<u8>,
}

/// Persisted broadcast (sender-key) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBroadcastSession {
    /// Business name
    pub name: String,
    /// Business device id
    pub device_id: u32,
    /// Distribution id shared by both halves
    pub distribution_id: DistributionId,
    /// Serialized sender-key record, needed to encrypt broadcasts
    pub sender_key_record: Option<Vec<u8>>,
    /// Serialized distribution message, needed by consumers to decrypt
    pub distribution_message: Option<Vec<u8>>,
}

impl StoredBroadcastSession {
    /// Whether both halves are present.
    pub fn is_complete(&self) -> bool {
        self.sender_key_record.is_some() && self.distribution_message.is_some()
    }

    /// Merge a sender-key record write into `existing`.
    pub fn with_sender_key(
        existing: Option<Self>,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        record: &[u8],
    ) -> Self {
        let mut merged = Self::base(existing, name, device_id, distribution_id);
        merged.sender_key_record = Some(record.to_vec());
        merged
    }

    /// Merge a distribution message write into `existing`.
    pub fn with_distribution_message(
        existing: Option<Self>,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        message: &[u8],
    ) -> Self {
        let mut merged = Self::base(existing, name, device_id, distribution_id);
        merged.distribution_message = Some(message.to_vec());
        merged
    }

    fn base(
        existing: Option<Self>,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
    ) -> Self {
        match existing {
            Some(record) if record.distribution_id == distribution_id => {
                Self { device_id, ..record }
            },
            _ => Self {
                name: name.to_string(),
                device_id,
                distribution_id,
                sender_key_record: None,
                distribution_message: None,
            },
        }
    }
}

/// Identity persistence, keyed by owner name.
pub trait IdentityStore: Send + Sync {
    /// Load the identity for `name`. `None` if never saved.
    fn load_identity(&self, name: &str) -> Result<Option<StoredIdentity>, StorageError>;

    /// Save the identity for `name`, replacing any previous one.
    fn save_identity(
        &self,
        name: &str,
        key_pair: &[u8],
        registration_id: u32,
    ) -> Result<(), StorageError>;
}

/// Direct-session persistence, keyed by (name, device id).
pub trait SessionStore: Send + Sync {
    /// Upsert the session for (`name`, `device_id`).
    fn save_session(&self, name: &str, device_id: u32, record: &[u8])
    -> Result<(), StorageError>;

    /// Every persisted session.
    fn load_sessions(&self) -> Result<Vec<StoredSession>, StorageError>;

    /// Delete every session for `name`.
    ///
    /// Deleting an absent session succeeds.
    fn delete_session(&self, name: &str) -> Result<(), StorageError>;
}

/// Broadcast-session persistence, keyed by owner name.
pub trait BroadcastSessionStore: Send + Sync {
    /// Save the sender-key half, preserving the distribution message.
    fn save_broadcast_session(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        sender_key_record: &[u8],
    ) -> Result<(), StorageError>;

    /// Save the distribution-message half, preserving the sender-key record.
    fn save_distribution_message(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        distribution_message: &[u8],
    ) -> Result<(), StorageError>;

    /// Load the broadcast session for `name`. `None` if never saved.
    fn load_broadcast_session(
        &self,
        name: &str,
    ) -> Result<Option<StoredBroadcastSession>, StorageError>;
}

/// Handles to the three persistence contracts.
///
/// Clone is cheap; clones share the same backends.
#[derive(Clone)]
pub struct Persistence {
    /// Identity store
    pub identities: Arc<dyn IdentityStore>,
    /// Session store
    pub sessions: Arc<dyn SessionStore>,
    /// Broadcast-session store
    pub broadcasts: Arc<dyn BroadcastSessionStore>,
}

impl Persistence {
    /// Use one backend for all three contracts.
    pub fn from_backend<S>(backend: S) -> Self
    where
        S: IdentityStore + SessionStore + BroadcastSessionStore + 'static,
    {
        let shared = Arc::new(backend);
        Self { identities: shared.clone(), sessions: shared.clone(), broadcasts: shared }
    }
}
