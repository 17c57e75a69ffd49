//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Identities, sessions and broadcast sessions survive business restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    BroadcastSessionStore, IdentityStore, SessionStore, StorageError, StoredBroadcastSession,
    StoredIdentity, StoredSession,
};
use crate::address::DistributionId;

/// Table: identities
/// Key: owner name (UTF-8)
/// Value: CBOR-encoded StoredIdentity
const IDENTITIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("identities");

/// Table: sessions
/// Key: (name, device_id) encoded by `encode_session_key`
/// Value: opaque session record
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");

/// Table: broadcast_sessions
/// Key: owner name (UTF-8)
/// Value: CBOR-encoded StoredBroadcastSession
const BROADCASTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("broadcast_sessions");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (IDENTITIES, SESSIONS, BROADCASTS).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(IDENTITIES).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(BROADCASTS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Read-modify-write one broadcast session inside a single transaction.
    fn merge_broadcast(
        &self,
        name: &str,
        merge: impl FnOnce(Option<StoredBroadcastSession>) -> StoredBroadcastSession,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(BROADCASTS).map_err(|e| StorageError::Io(e.to_string()))?;

            let existing = match table
                .get(name.as_bytes())
                .map_err(|e| StorageError::Io(e.to_string()))?
            {
                Some(value) => Some(decode::<StoredBroadcastSession>(value.value())?),
                None => None,
            };

            let bytes = encode(&merge(existing))?;
            table
                .insert(name.as_bytes(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

impl IdentityStore for RedbStorage {
    fn load_identity(&self, name: &str) -> Result<Option<StoredIdentity>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(IDENTITIES).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(name.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn save_identity(
        &self,
        name: &str,
        key_pair: &[u8],
        registration_id: u32,
    ) -> Result<(), StorageError> {
        let bytes = encode(&StoredIdentity { key_pair: key_pair.to_vec(), registration_id })?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(IDENTITIES).map_err(|e| StorageError::Io(e.to_string()))?;
            table
                .insert(name.as_bytes(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

impl SessionStore for RedbStorage {
    fn save_session(
        &self,
        name: &str,
        device_id: u32,
        record: &[u8],
    ) -> Result<(), StorageError> {
        let key = encode_session_key(name, device_id)?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            table.insert(key.as_slice(), record).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<StoredSession>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut sessions = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let (name, device_id) = decode_session_key(key.value())?;
            sessions.push(StoredSession { name, device_id, record: value.value().to_vec() });
        }

        Ok(sessions)
    }

    fn delete_session(&self, name: &str) -> Result<(), StorageError> {
        let start_key = encode_session_key(name, 0)?;
        let end_key = encode_session_key(name, u32::MAX)?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            let mut doomed = Vec::new();
            for result in table
                .range(start_key.as_slice()..=end_key.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?
            {
                let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                doomed.push(key.value().to_vec());
            }

            for key in doomed {
                table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

impl BroadcastSessionStore for RedbStorage {
    fn save_broadcast_session(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        sender_key_record: &[u8],
    ) -> Result<(), StorageError> {
        self.merge_broadcast(name, |existing| {
            StoredBroadcastSession::with_sender_key(
                existing,
                name,
                device_id,
                distribution_id,
                sender_key_record,
            )
        })
    }

    fn save_distribution_message(
        &self,
        name: &str,
        device_id: u32,
        distribution_id: DistributionId,
        distribution_message: &[u8],
    ) -> Result<(), StorageError> {
        self.merge_broadcast(name, |existing| {
            StoredBroadcastSession::with_distribution_message(
                existing,
                name,
                device_id,
                distribution_id,
                distribution_message,
            )
        })
    }

    fn load_broadcast_session(
        &self,
        name: &str,
    ) -> Result<Option<StoredBroadcastSession>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(BROADCASTS).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(name.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Encode (name, device_id) as a length-prefixed key.
///
/// Layout: [name length: 2 bytes BE][name: UTF-8][device_id: 4 bytes BE]
/// The length prefix keeps one name's keys contiguous, so a range scan over
/// device ids 0..=MAX never touches another name that shares a prefix.
fn encode_session_key(name: &str, device_id: u32) -> Result<Vec<u8>, StorageError> {
    let len = u16::try_from(name.len())
        .map_err(|_| StorageError::Serialization(format!("name too long: {} bytes", name.len())))?;

    let mut key = Vec::with_capacity(2 + name.len() + 4);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key.extend_from_slice(&device_id.to_be_bytes());
    Ok(key)
}

/// Decode a session key back to (name, device_id).
fn decode_session_key(key: &[u8]) -> Result<(String, u32), StorageError> {
    let corrupt = || StorageError::Serialization("corrupt session key".to_string());

    let (len, rest) = key.split_first_chunk::<2>().ok_or_else(corrupt)?;
    let len = usize::from(u16::from_be_bytes(*len));
    if rest.len() != len + 4 {
        return Err(corrupt());
    }

    let (name, device) = rest.split_at(len);
    let name = String::from_utf8(name.to_vec()).map_err(|_| corrupt())?;
    let device_id = u32::from_be_bytes(device.try_into().map_err(|_| corrupt())?);
    Ok((name, device_id))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn session_key_roundtrip() {
        let key = encode_session_key("alice", 123).unwrap();
        assert_eq!(decode_session_key(&key).unwrap(), ("alice".to_string(), 123));
    }

    #[test]
    fn session_key_range_excludes_prefix_sharing_names() {
        let start = encode_session_key("alice", 0).unwrap();
        let end = encode_session_key("alice", u32::MAX).unwrap();
        let range = start..=end;

        assert!(range.contains(&encode_session_key("alice", 123).unwrap()));
        assert!(!range.contains(&encode_session_key("alicia", 0).unwrap()));
        assert!(!range.contains(&encode_session_key("alic", u32::MAX).unwrap()));
    }

    #[test]
    fn truncated_session_key_is_rejected() {
        assert!(decode_session_key(&[0, 5, b'a']).is_err());
    }

    #[test]
    fn delete_session_leaves_prefix_sharing_names() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("sessions.redb")).unwrap();

        storage.save_session("alice", 123, b"a").unwrap();
        storage.save_session("alice", 7, b"a7").unwrap();
        storage.save_session("alicia", 123, b"b").unwrap();

        storage.delete_session("alice").unwrap();
        storage.delete_session("alice").unwrap();

        let remaining = storage.load_sessions().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "alicia");
    }

    #[test]
    fn broadcast_halves_merge_in_one_transaction() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("broadcast.redb")).unwrap();
        let id = DistributionId::from_random_bytes([4; 16]);

        storage.save_distribution_message("acme", 1, id, b"dm").unwrap();
        storage.save_broadcast_session("acme", 1, id, b"skr").unwrap();

        let stored = storage.load_broadcast_session("acme").unwrap().unwrap();
        assert!(stored.is_complete());
        assert_eq!(stored.distribution_id, id);
    }
}
