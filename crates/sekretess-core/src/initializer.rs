//! Startup: load or create the business identity, rehydrate sessions and
//! ensure a usable broadcast session.

use tracing::{debug, info, warn};

use crate::{
    address::{DistributionId, LocalIdentity, ProtocolAddress},
    bridge::StoreBridge,
    engine::CryptoEngine,
    env::Environment,
    error::InitError,
    storage::{Persistence, StoredBroadcastSession},
};

/// Builds a ready [`StoreBridge`] from persisted state.
pub struct StoreInitializer<E: CryptoEngine, V: Environment> {
    engine: E,
    persistence: Persistence,
    env: V,
}

impl<E: CryptoEngine, V: Environment> StoreInitializer<E, V> {
    /// Create an initializer. `env` supplies fresh distribution ids.
    pub fn new(engine: E, persistence: Persistence, env: V) -> Self {
        Self { engine, persistence, env }
    }

    /// Initialize the business `name` on `device_id`.
    ///
    /// On first run generates and persists an identity and a broadcast
    /// session. On later runs restores the identity, caches every decodable
    /// session, and recreates the broadcast session if it is missing, half
    /// populated or unreadable.
    ///
    /// # Errors
    ///
    /// - `InitError::Storage` if persistence cannot be read or the new
    ///   identity or broadcast session cannot be written
    /// - `InitError::CorruptIdentity` if the persisted identity cannot be
    ///   restored
    /// - `InitError::Engine` if the engine cannot create a broadcast session
    pub fn initialize(self, name: &str, device_id: u32) -> Result<StoreBridge<E>, InitError> {
        let local_address = ProtocolAddress::new(name, device_id);

        let Some(stored) = self.persistence.identities.load_identity(name)? else {
            let identity = self.engine.generate_identity();
            self.persistence.identities.save_identity(
                name,
                identity.key_pair(),
                identity.registration_id(),
            )?;
            info!(%local_address, "generated business identity");

            let bridge = StoreBridge::new(self.engine, identity, local_address, self.persistence);
            create_broadcast_session(&bridge, &self.env)?;
            return Ok(bridge);
        };

        let identity: LocalIdentity = self
            .engine
            .restore_identity(&stored.key_pair, stored.registration_id)
            .map_err(|source| InitError::CorruptIdentity { name: name.to_string(), source })?;
        let bridge = StoreBridge::new(self.engine, identity, local_address, self.persistence);

        rehydrate_sessions(&bridge)?;

        match bridge.load_broadcast_session()? {
            Some(session) if session.is_complete() => {
                if !restore_broadcast_session(&bridge, &session) {
                    create_broadcast_session(&bridge, &self.env)?;
                }
            },
            Some(session) => {
                warn!(
                    business = name,
                    distribution_id = %session.distribution_id,
                    "broadcast session half populated, recreating"
                );
                create_broadcast_session(&bridge, &self.env)?;
            },
            None => {
                info!(business = name, "no broadcast session, creating");
                create_broadcast_session(&bridge, &self.env)?;
            },
        }

        info!(
            address = %bridge.local_address(),
            sessions = bridge.session_count(),
            "business store initialized"
        );
        Ok(bridge)
    }
}

fn rehydrate_sessions<E: CryptoEngine>(bridge: &StoreBridge<E>) -> Result<(), InitError> {
    for stored in bridge.persistence().sessions.load_sessions()? {
        let address = ProtocolAddress::new(stored.name, stored.device_id);
        match bridge.engine().deserialize_session(&stored.record) {
            Ok(session) => bridge.cache_session(&address, session),
            Err(error) => warn!(%address, %error, "skipping unreadable session record"),
        }
    }
    Ok(())
}

/// Returns false if the sender-key record cannot be decoded.
fn restore_broadcast_session<E: CryptoEngine>(
    bridge: &StoreBridge<E>,
    session: &StoredBroadcastSession,
) -> bool {
    let Some(record) = &session.sender_key_record else {
        return false;
    };

    match bridge.engine().deserialize_sender_key(record) {
        Ok(sender_key) => {
            bridge.cache_sender_key(bridge.local_address(), session.distribution_id, sender_key);
            debug!(distribution_id = %session.distribution_id, "restored broadcast session");
            true
        },
        Err(error) => {
            warn!(
                distribution_id = %session.distribution_id,
                %error,
                "unreadable sender key record, recreating broadcast session"
            );
            false
        },
    }
}

fn create_broadcast_session<E: CryptoEngine, V: Environment>(
    bridge: &StoreBridge<E>,
    env: &V,
) -> Result<(), InitError> {
    let mut bytes = [0u8; 16];
    env.random_bytes(&mut bytes);
    let distribution_id = DistributionId::from_random_bytes(bytes);
    let sender = bridge.local_address();

    let (sender_key, distribution_message) =
        bridge.engine().create_sender_key_session(sender, distribution_id)?;
    let record = bridge.engine().serialize_sender_key(&sender_key)?;

    let broadcasts = &bridge.persistence().broadcasts;
    broadcasts.save_broadcast_session(sender.name(), sender.device_id(), distribution_id, &record)?;
    broadcasts.save_distribution_message(
        sender.name(),
        sender.device_id(),
        distribution_id,
        &distribution_message,
    )?;
    bridge.cache_sender_key(sender, distribution_id, sender_key);

    info!(%sender, %distribution_id, "created broadcast session");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::RatchetEngine,
        env::SystemEnv,
        storage::{BroadcastSessionStore, IdentityStore, MemoryStorage, SessionStore},
    };

    fn initialize(storage: &MemoryStorage) -> Result<StoreBridge<RatchetEngine<SystemEnv>>, InitError> {
        StoreInitializer::new(
            RatchetEngine::new(SystemEnv::new()),
            Persistence::from_backend(storage.clone()),
            SystemEnv::new(),
        )
        .initialize("acme", 1)
    }

    #[test]
    fn first_run_creates_identity_and_broadcast_session() {
        let storage = MemoryStorage::new();
        let bridge = initialize(&storage).unwrap();

        assert!(storage.has_identity("acme"));
        let broadcast = storage.load_broadcast_session("acme").unwrap().unwrap();
        assert!(broadcast.is_complete());
        assert!(bridge.has_sender_key(broadcast.distribution_id));
        assert_eq!(bridge.session_count(), 0);
    }

    #[test]
    fn restart_restores_identity_and_broadcast_session() {
        let storage = MemoryStorage::new();
        let first = initialize(&storage).unwrap();
        let first_key = first.local_identity().identity_key().clone();
        let first_dist = storage.load_broadcast_session("acme").unwrap().unwrap().distribution_id;
        drop(first);

        let second = initialize(&storage).unwrap();

        assert_eq!(second.local_identity().identity_key(), &first_key);
        assert!(second.has_sender_key(first_dist));
    }

    #[test]
    fn half_populated_broadcast_session_is_recreated() {
        let storage = MemoryStorage::new();
        drop(initialize(&storage).unwrap());
        let stale = DistributionId::from_random_bytes([3; 16]);
        storage.put_broadcast_session(StoredBroadcastSession {
            name: "acme".to_string(),
            device_id: 1,
            distribution_id: stale,
            sender_key_record: Some(vec![1, 2, 3]),
            distribution_message: None,
        });

        let bridge = initialize(&storage).unwrap();

        let broadcast = storage.load_broadcast_session("acme").unwrap().unwrap();
        assert!(broadcast.is_complete());
        assert_ne!(broadcast.distribution_id, stale);
        assert!(bridge.has_sender_key(broadcast.distribution_id));
    }

    #[test]
    fn unreadable_sessions_are_skipped() {
        let storage = MemoryStorage::new();
        drop(initialize(&storage).unwrap());
        storage.save_session("mallory", 123, b"not a session").unwrap();

        let bridge = initialize(&storage).unwrap();

        assert_eq!(bridge.session_count(), 0);
        assert_eq!(storage.session_count(), 1);
    }

    #[test]
    fn corrupt_identity_is_fatal() {
        let storage = MemoryStorage::new();
        storage.save_identity("acme", &[0xde, 0xad], 7).unwrap();

        let result = initialize(&storage);
        assert!(matches!(result, Err(InitError::CorruptIdentity { ref name, .. }) if name == "acme"));
    }
}
