//! Write-through bridge between engine state and persistence.
//!
//! The bridge owns every live session and sender key. Each mutation lands in
//! memory first and is then mirrored to the matching persistence contract.
//! A failed mirror never undoes the in-memory change; it is reported as a
//! [`PersistenceWarning`] so operators can detect drift between memory and
//! durable storage.
//!
//! Callers serialize work per address (the dispatcher holds a per-consumer
//! lock); the bridge itself only guarantees that its maps stay consistent.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    address::{DistributionId, IdentityKey, LocalIdentity, ProtocolAddress},
    bundle::ConsumerKeyBundle,
    engine::CryptoEngine,
    error::{EngineError, KeyAgreementError},
    storage::{Persistence, StorageError, StoredBroadcastSession},
};

/// Buffered warnings per subscriber before the oldest are dropped.
const WARNING_CAPACITY: usize = 64;

/// Mirrored operation that failed to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceOp {
    /// Session upsert
    SaveSession,
    /// Session delete
    DeleteSession,
    /// Sender-key half of the broadcast session
    SaveSenderKey,
}

impl fmt::Display for PersistenceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SaveSession => "save_session",
            Self::DeleteSession => "delete_session",
            Self::SaveSenderKey => "save_sender_key",
        })
    }
}

/// Durable storage no longer matches in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceWarning {
    /// Operation that failed
    pub operation: PersistenceOp,
    /// Owner name of the affected record
    pub name: String,
    /// Device id of the affected record
    pub device_id: u32,
    /// Storage failure
    pub error: StorageError,
}

struct BridgeState<S, K> {
    sessions: HashMap<ProtocolAddress, S>,
    sender_keys: HashMap<(ProtocolAddress, DistributionId), K>,
    /// Pinned remote identities; trust on first use
    trusted: HashMap<ProtocolAddress, IdentityKey>,
}

/// Engine state cache with write-through persistence.
pub struct StoreBridge<E: CryptoEngine> {
    engine: E,
    identity: LocalIdentity,
    local_address: ProtocolAddress,
    persistence: Persistence,
    state: Mutex<BridgeState<E::Session, E::SenderKey>>,
    warnings: broadcast::Sender<PersistenceWarning>,
    drift: AtomicU64,
}

impl<E: CryptoEngine> StoreBridge<E> {
    /// Create an empty bridge for the business at `local_address`.
    pub fn new(
        engine: E,
        identity: LocalIdentity,
        local_address: ProtocolAddress,
        persistence: Persistence,
    ) -> Self {
        let (warnings, _) = broadcast::channel(WARNING_CAPACITY);
        Self {
            engine,
            identity,
            local_address,
            persistence,
            state: Mutex::new(BridgeState {
                sessions: HashMap::new(),
                sender_keys: HashMap::new(),
                trusted: HashMap::new(),
            }),
            warnings,
            drift: AtomicU64::new(0),
        }
    }

    /// The crypto engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The business identity.
    pub fn local_identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// The business address (name, device id).
    pub fn local_address(&self) -> &ProtocolAddress {
        &self.local_address
    }

    /// Persistence handles the bridge mirrors into.
    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Subscribe to persistence drift warnings.
    ///
    /// Only warnings raised after subscribing are delivered.
    pub fn subscribe_warnings(&self) -> broadcast::Receiver<PersistenceWarning> {
        self.warnings.subscribe()
    }

    /// Number of mirror writes that failed since startup.
    pub fn drift_count(&self) -> u64 {
        self.drift.load(Ordering::Relaxed)
    }

    /// Whether a session is cached for `address`.
    pub fn has_session(&self, address: &ProtocolAddress) -> bool {
        self.lock_state().sessions.contains_key(address)
    }

    /// Number of cached sessions.
    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    /// Identity key the cached session for `address` was established with.
    pub fn session_remote_identity(&self, address: &ProtocolAddress) -> Option<IdentityKey> {
        let state = self.lock_state();
        state.sessions.get(address).map(|s| self.engine.session_remote_identity(s).clone())
    }

    /// Whether `identity` may be used for `address`.
    ///
    /// True when nothing is pinned yet or the pinned key is identical.
    pub fn is_trusted_identity(&self, address: &ProtocolAddress, identity: &IdentityKey) -> bool {
        self.lock_state().trusted.get(address).is_none_or(|pinned| pinned == identity)
    }

    /// Drop the pinned identity for `address`, returning it.
    ///
    /// The next successful establishment pins whatever key it was built with.
    pub fn forget_identity(&self, address: &ProtocolAddress) -> Option<IdentityKey> {
        self.lock_state().trusted.remove(address)
    }

    /// Establish and store a session from a key bundle.
    ///
    /// The bundle's identity is pinned only once key agreement succeeds.
    /// Nothing is pinned, cached or persisted on failure.
    pub fn establish_session(
        &self,
        address: &ProtocolAddress,
        bundle: &ConsumerKeyBundle,
    ) -> Result<(), KeyAgreementError> {
        if !self.is_trusted_identity(address, &bundle.identity_key) {
            return Err(KeyAgreementError::UntrustedIdentity { address: address.to_string() });
        }

        let session = self.engine.establish_session(&self.identity, address, bundle)?;
        self.lock_state().trusted.insert(address.clone(), bundle.identity_key.clone());
        self.store_session(address, session);
        Ok(())
    }

    /// Cache `session` and mirror it to the session store.
    pub fn store_session(&self, address: &ProtocolAddress, session: E::Session) {
        let record = self.engine.serialize_session(&session);
        self.lock_state().sessions.insert(address.clone(), session);
        self.mirror_session(address, record);
    }

    /// Cache a rehydrated session without writing it back.
    ///
    /// Pins the session's remote identity if nothing is pinned yet.
    pub fn cache_session(&self, address: &ProtocolAddress, session: E::Session) {
        let remote = self.engine.session_remote_identity(&session).clone();
        let mut state = self.lock_state();
        state.trusted.entry(address.clone()).or_insert(remote);
        state.sessions.insert(address.clone(), session);
    }

    /// Encrypt with the cached session for `address` and mirror the advanced
    /// state.
    pub fn encrypt_session(
        &self,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let (ciphertext, record) = {
            let mut state = self.lock_state();
            let session = state
                .sessions
                .get_mut(address)
                .ok_or_else(|| EngineError::NoSession(address.to_string()))?;
            let ciphertext = self.engine.encrypt_session(session, plaintext)?;
            (ciphertext, self.engine.serialize_session(session))
        };

        self.mirror_session(address, record);
        Ok(ciphertext)
    }

    /// Delete the session for `address` from memory and the session store.
    ///
    /// Deleting an absent session succeeds. A storage failure is reported as a
    /// warning and also returned; the in-memory session is gone either way.
    pub fn delete_session(&self, address: &ProtocolAddress) -> Result<(), StorageError> {
        let removed = self.lock_state().sessions.remove(address).is_some();
        debug!(%address, removed, "deleting session");

        self.persistence.sessions.delete_session(address.name()).inspect_err(|error| {
            self.report(PersistenceOp::DeleteSession, address, error.clone());
        })
    }

    /// Cache `sender_key` and mirror it to the broadcast-session store.
    ///
    /// The persisted distribution message for the same distribution id is
    /// preserved.
    pub fn store_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: DistributionId,
        sender_key: E::SenderKey,
    ) {
        let record = self.engine.serialize_sender_key(&sender_key);
        self.lock_state().sender_keys.insert((sender.clone(), distribution_id), sender_key);
        self.mirror_sender_key(sender, distribution_id, record);
    }

    /// Cache a rehydrated sender key without writing it back.
    pub fn cache_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: DistributionId,
        sender_key: E::SenderKey,
    ) {
        self.lock_state().sender_keys.insert((sender.clone(), distribution_id), sender_key);
    }

    /// Whether the business sender key for `distribution_id` is cached.
    pub fn has_sender_key(&self, distribution_id: DistributionId) -> bool {
        self.lock_state().sender_keys.contains_key(&(self.local_address.clone(), distribution_id))
    }

    /// Encrypt a broadcast with the business sender key and mirror the
    /// advanced state.
    pub fn encrypt_group(
        &self,
        distribution_id: DistributionId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let key = (self.local_address.clone(), distribution_id);
        let (ciphertext, record) = {
            let mut state = self.lock_state();
            let sender_key = state
                .sender_keys
                .get_mut(&key)
                .ok_or(EngineError::NoSenderKey(distribution_id))?;
            let ciphertext = self.engine.encrypt_group(sender_key, plaintext)?;
            (ciphertext, self.engine.serialize_sender_key(sender_key))
        };

        self.mirror_sender_key(&self.local_address, distribution_id, record);
        Ok(ciphertext)
    }

    /// The persisted broadcast session of the business.
    pub fn load_broadcast_session(&self) -> Result<Option<StoredBroadcastSession>, StorageError> {
        self.persistence.broadcasts.load_broadcast_session(self.local_address.name())
    }

    fn mirror_session(&self, address: &ProtocolAddress, record: Result<Vec<u8>, EngineError>) {
        let result = record
            .map_err(|e| StorageError::Serialization(e.to_string()))
            .and_then(|record| {
                self.persistence.sessions.save_session(address.name(), address.device_id(), &record)
            });
        if let Err(error) = result {
            self.report(PersistenceOp::SaveSession, address, error);
        }
    }

    fn mirror_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: DistributionId,
        record: Result<Vec<u8>, EngineError>,
    ) {
        let result = record.map_err(|e| StorageError::Serialization(e.to_string())).and_then(
            |record| {
                self.persistence.broadcasts.save_broadcast_session(
                    sender.name(),
                    sender.device_id(),
                    distribution_id,
                    &record,
                )
            },
        );
        if let Err(error) = result {
            self.report(PersistenceOp::SaveSenderKey, sender, error);
        }
    }

    fn report(&self, operation: PersistenceOp, address: &ProtocolAddress, error: StorageError) {
        warn!(
            %operation,
            name = address.name(),
            device_id = address.device_id(),
            %error,
            "persistence drift: in-memory state kept"
        );
        self.drift.fetch_add(1, Ordering::Relaxed);

        // No subscribers is fine; the log line and counter still record it
        let _ = self.warnings.send(PersistenceWarning {
            operation,
            name: address.name().to_string(),
            device_id: address.device_id(),
            error,
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, BridgeState<E::Session, E::SenderKey>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use sekretess_crypto::{PreKeyPair, SigningKeyPair};

    use super::*;
    use crate::{
        bundle::{PreKey, SignedPreKey},
        engine::RatchetEngine,
        env::SystemEnv,
        storage::{BroadcastSessionStore, ChaoticStorage, MemoryStorage},
    };

    fn bundle_for(consumer: &SigningKeyPair) -> ConsumerKeyBundle {
        let spk = PreKeyPair::from_seed([40u8; 32]).public_key();
        let opk = PreKeyPair::from_seed([41u8; 32]).public_key();
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

    fn bridge(persistence: Persistence) -> StoreBridge<RatchetEngine<SystemEnv>> {
        let engine = RatchetEngine::new(SystemEnv::new());
        let identity = engine.generate_identity();
        StoreBridge::new(engine, identity, ProtocolAddress::new("acme", 1), persistence)
    }

    #[test]
    fn established_session_is_mirrored() {
        let storage = MemoryStorage::new();
        let bridge = bridge(Persistence::from_backend(storage.clone()));
        let alice = ProtocolAddress::new("alice", 123);

        bridge.establish_session(&alice, &bundle_for(&SigningKeyPair::from_seed(&[9; 32]))).unwrap();

        assert!(bridge.has_session(&alice));
        assert_eq!(storage.session_count(), 1);
        assert_eq!(bridge.drift_count(), 0);
    }

    #[test]
    fn pinned_identity_rejects_different_key() {
        let bridge = bridge(Persistence::from_backend(MemoryStorage::new()));
        let alice = ProtocolAddress::new("alice", 123);
        bridge.establish_session(&alice, &bundle_for(&SigningKeyPair::from_seed(&[9; 32]))).unwrap();

        let result =
            bridge.establish_session(&alice, &bundle_for(&SigningKeyPair::from_seed(&[10; 32])));

        assert_eq!(
            result,
            Err(KeyAgreementError::UntrustedIdentity { address: "alice.123".to_string() })
        );
    }

    #[test]
    fn forgotten_identity_is_pinned_again_on_establish() {
        let bridge = bridge(Persistence::from_backend(MemoryStorage::new()));
        let alice = ProtocolAddress::new("alice", 123);
        let original = bundle_for(&SigningKeyPair::from_seed(&[9; 32]));
        bridge.establish_session(&alice, &original).unwrap();

        let rotated = bundle_for(&SigningKeyPair::from_seed(&[10; 32]));
        assert_eq!(bridge.forget_identity(&alice), Some(original.identity_key.clone()));
        bridge.establish_session(&alice, &rotated).unwrap();

        assert_eq!(bridge.session_remote_identity(&alice), Some(rotated.identity_key.clone()));
        assert!(!bridge.is_trusted_identity(&alice, &original.identity_key));
    }

    #[test]
    fn failed_establish_pins_nothing() {
        let bridge = bridge(Persistence::from_backend(MemoryStorage::new()));
        let alice = ProtocolAddress::new("alice", 123);
        let mut forged = bundle_for(&SigningKeyPair::from_seed(&[11; 32]));
        forged.signed_prekey.signature = vec![0; 64];

        assert!(bridge.establish_session(&alice, &forged).is_err());

        assert!(!bridge.has_session(&alice));
        let genuine = bundle_for(&SigningKeyPair::from_seed(&[12; 32]));
        assert!(bridge.is_trusted_identity(&alice, &genuine.identity_key));
        bridge.establish_session(&alice, &genuine).unwrap();
    }

    #[test]
    fn poisoned_state_is_recovered() {
        let bridge = bridge(Persistence::from_backend(MemoryStorage::new()));
        let alice = ProtocolAddress::new("alice", 123);
        bridge.establish_session(&alice, &bundle_for(&SigningKeyPair::from_seed(&[9; 32]))).unwrap();

        let poisoner = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = bridge.state.lock();
                panic!("poison the bridge state");
            })
            .join()
        });
        assert!(poisoner.is_err());
        assert!(bridge.state.is_poisoned());

        assert!(bridge.has_session(&alice));
        bridge.encrypt_session(&alice, b"after poison").unwrap();
    }

    #[test]
    fn encrypt_without_session_fails() {
        let bridge = bridge(Persistence::from_backend(MemoryStorage::new()));

        let result = bridge.encrypt_session(&ProtocolAddress::new("bob", 123), b"hi");
        assert_eq!(result, Err(EngineError::NoSession("bob.123".to_string())));
    }

    #[test]
    fn failed_mirror_keeps_memory_and_warns() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0).writes_only();
        let bridge = bridge(Persistence::from_backend(storage));
        let mut warnings = bridge.subscribe_warnings();
        let alice = ProtocolAddress::new("alice", 123);

        bridge.establish_session(&alice, &bundle_for(&SigningKeyPair::from_seed(&[9; 32]))).unwrap();
        bridge.encrypt_session(&alice, b"still works").unwrap();

        assert!(bridge.has_session(&alice));
        assert_eq!(bridge.drift_count(), 2);
        let warning = warnings.try_recv().unwrap();
        assert_eq!(warning.operation, PersistenceOp::SaveSession);
        assert_eq!(warning.name, "alice");
        assert_eq!(warning.device_id, 123);
    }

    #[test]
    fn delete_is_idempotent() {
        let storage = MemoryStorage::new();
        let bridge = bridge(Persistence::from_backend(storage.clone()));
        let alice = ProtocolAddress::new("alice", 123);
        bridge.establish_session(&alice, &bundle_for(&SigningKeyPair::from_seed(&[9; 32]))).unwrap();

        bridge.delete_session(&alice).unwrap();
        bridge.delete_session(&alice).unwrap();

        assert!(!bridge.has_session(&alice));
        assert_eq!(storage.session_count(), 0);
    }

    #[test]
    fn sender_key_write_preserves_distribution_message() {
        let storage = MemoryStorage::new();
        let bridge = bridge(Persistence::from_backend(storage.clone()));
        let id = DistributionId::from_random_bytes([7; 16]);
        let acme = bridge.local_address().clone();
        let (sender_key, distribution) =
            bridge.engine().create_sender_key_session(&acme, id).unwrap();

        storage.save_distribution_message("acme", 1, id, &distribution).unwrap();
        bridge.store_sender_key(&acme, id, sender_key);
        bridge.encrypt_group(id, b"promo").unwrap();

        let stored = bridge.load_broadcast_session().unwrap().unwrap();
        assert!(stored.is_complete());
        assert_eq!(stored.distribution_message, Some(distribution));
        assert!(bridge.has_sender_key(id));
    }

    #[test]
    fn encrypt_group_requires_cached_sender_key() {
        let bridge = bridge(Persistence::from_backend(MemoryStorage::new()));
        let id = DistributionId::from_random_bytes([7; 16]);

        assert_eq!(bridge.encrypt_group(id, b"promo"), Err(EngineError::NoSenderKey(id)));
    }
}
