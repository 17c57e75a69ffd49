use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{
    BroadcastSessionStore, IdentityStore, SessionStore, StorageError, StoredBroadcastSession,
    StoredIdentity, StoredSession,
};
use crate::address::DistributionId;

/// In-memory storage implementation for tests and ephemeral businesses
///
/// All state is wrapped in `Arc<Mutex<>>` so clones share the same stores.
/// A poisoned mutex is recovered: every write leaves the maps consistent.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    identities: HashMap<String, StoredIdentity>,

    /// Sessions keyed by (name, device id), ordered for stable `load_sessions`
    sessions: BTreeMap<(String, u32), Vec<u8>>,

    broadcasts: HashMap<String, StoredBroadcastSession>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether an identity is persisted for `name`.
    pub fn has_identity(&self, name: &str) -> bool {
        self.lock().identities.contains_key(name)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite a broadcast session verbatim, bypassing the merge rules.
    ///
    /// Lets tests seed half-populated or corrupt records.
    pub fn put_broadcast_session(&self, session: StoredBroadcastSession) {
        let mut inner = self.lock();
        inner.broadcasts.insert(session.name.clone(), session);
    }
}

impl IdentityStore for MemoryStorage {
    fn load_identity(&self, name: &str) -> Result<Option<StoredIdentity>, StorageError> {
        Ok(self.lock().identities.get(name).cloned())
    }

    fn save_identity(
        &self,
        name: &str,
        key_pair: &[u8],
        registration_id: u32,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner
            .identities
            .insert(name.to_string(), StoredIdentity { key_pair: key_pair.to_vec(), registration_id });
        Ok(())
    }
}

impl SessionStore for MemoryStorage {
    fn save_session(
        &self,
        name: &str,
        device_id: u32,
        record: &[u8],
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.sessions.insert((name.to_string(), device_id), record.to_vec());
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<StoredSession>, StorageError> {
        let inner = self.lock();
        Ok(inner
            .sessions
            .iter()
            .map(|((name, device_id), record)| StoredSession {
                name: name.clone(),
                device_id: *device_id,
                record: record.clone(),
            })
            .collect())
    }

    fn delete_session(&self, name: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.sessions.retain(|(owner, _), _| owner != name);
        Ok(())
    }
}

impl BroadcastSessionStore for MemoryStorage {
    fn save_broadcast_session(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        sender_key_record: &[u8],
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let existing = inner.broadcasts.remove(name);
        let merged = StoredBroadcastSession::with_sender_key(
            existing,
            name,
            device_id,
            distribution_id,
            sender_key_record,
        );
        inner.broadcasts.insert(name.to_string(), merged);
        Ok(())
    }

    fn save_distribution_message(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        distribution_message: &[u8],
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let existing = inner.broadcasts.remove(name);
        let merged = StoredBroadcastSession::with_distribution_message(
            existing,
            name,
            device_id,
            distribution_id,
            distribution_message,
        );
        inner.broadcasts.insert(name.to_string(), merged);
        Ok(())
    }

    fn load_broadcast_session(
        &self,
        name: &str,
    ) -> Result<Option<StoredBroadcastSession>, StorageError> {
        Ok(self.lock().broadcasts.get(name).cloned())
    }
}
