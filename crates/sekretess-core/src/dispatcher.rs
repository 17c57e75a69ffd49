//! Message-send protocol.
//!
//! One direct message runs through
//! `NoSession -> SessionEstablished -> Sent`, or, when the server reports a
//! different identity key for the consumer than the one the session was
//! built with, through one rebuild and exactly one resend. The retry response
//! is not checked again.
//!
//! Work for one consumer is serialized by a per-consumer lock; broadcasts are
//! serialized by a single writer lock. Distribution-message pushes happen
//! after the triggering lock is released.

use std::sync::{Mutex, PoisonError};

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use tracing::{debug, error, info};

use crate::{
    address::{IdentityKey, ProtocolAddress},
    bridge::StoreBridge,
    bundle::ConsumerKeyBundle,
    channel::{ChannelError, DeliveryReceipt, MessageType, ServerChannel},
    engine::CryptoEngine,
    error::{ConsistencyError, DispatchError, EngineError, PrekeyBundleError},
    keyed_lock::KeyedLocks,
    storage::StoredBroadcastSession,
};

/// Device id every consumer session is keyed under.
pub const DEFAULT_CONSUMER_DEVICE_ID: u32 = 123;

/// Dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Fixed device id for 1:1 consumer sessions
    pub consumer_device_id: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { consumer_device_id: DEFAULT_CONSUMER_DEVICE_ID }
    }
}

/// Outcome of one locked delivery.
enum Delivery {
    Delivered,
    /// Session rebuilt after an identity mismatch; carries the subscription
    /// flag of the first response
    Rebuilt { subscribed: bool },
}

/// Sends direct messages, broadcasts and distribution messages for one
/// business.
pub struct Dispatcher<E: CryptoEngine, C: ServerChannel> {
    bridge: StoreBridge<E>,
    channel: C,
    config: DispatcherConfig,
    consumer_locks: KeyedLocks,
    broadcast_lock: Mutex<()>,
}

impl<E: CryptoEngine, C: ServerChannel> Dispatcher<E, C> {
    /// Create a dispatcher with default settings.
    pub fn new(bridge: StoreBridge<E>, channel: C) -> Self {
        Self::with_config(bridge, channel, DispatcherConfig::default())
    }

    /// Create a dispatcher with explicit settings.
    pub fn with_config(bridge: StoreBridge<E>, channel: C, config: DispatcherConfig) -> Self {
        Self {
            bridge,
            channel,
            config,
            consumer_locks: KeyedLocks::default(),
            broadcast_lock: Mutex::new(()),
        }
    }

    /// The bridge holding sessions and the broadcast sender key.
    pub fn bridge(&self) -> &StoreBridge<E> {
        &self.bridge
    }

    /// The server channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Active settings.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Encrypt `text` for `consumer` and deliver it.
    ///
    /// Establishes a session on first use. If the server reports a different
    /// identity key than the session's, rebuilds the session from a fresh
    /// bundle and resends once; if the consumer is subscribed to broadcasts
    /// the distribution message is then pushed to them.
    ///
    /// # Errors
    ///
    /// - `PrekeyBundle` if the key bundle cannot be fetched or parsed
    /// - `SessionCreation` if key agreement fails
    /// - `MessageSend` if encryption or delivery fails
    pub fn send_message_to_consumer(&self, text: &str, consumer: &str) -> Result<(), DispatchError> {
        self.send_message(text.as_bytes(), consumer, MessageType::Private)
    }

    /// Push the broadcast distribution message to `consumer`.
    ///
    /// Best effort: failures are logged, never returned.
    pub fn send_sender_key_distribution_message(&self, consumer: &str) {
        if let Err(error) = self.try_send_distribution(consumer) {
            error!(consumer, %error, "failed to send sender key distribution message");
        }
    }

    /// Encrypt `text` with the broadcast sender key and publish it.
    ///
    /// Consumers the server reports as newly subscribed receive the
    /// distribution message afterwards.
    ///
    /// # Errors
    ///
    /// `MessageSend` if the broadcast session is missing or half populated,
    /// or if encryption or delivery fails.
    pub fn send_ads_message(&self, text: &str) -> Result<(), DispatchError> {
        let business = self.bridge.local_address().name().to_string();

        let pending = {
            let _guard = self.broadcast_lock.lock().unwrap_or_else(PoisonError::into_inner);

            let session = self.complete_broadcast_session()?;
            let ciphertext = self
                .bridge
                .encrypt_group(session.distribution_id, text.as_bytes())
                .map_err(|e| match e {
                    EngineError::NoSenderKey(distribution_id) => DispatchError::send(
                        &business,
                        ConsistencyError::SenderKeyNotLoaded { distribution_id },
                    ),
                    other => DispatchError::send(&business, other),
                })?;

            self.channel
                .send_ads_message(&B64.encode(ciphertext), &business)
                .map_err(|e| DispatchError::send(&business, e))?
        };

        info!(business, pending = pending.len(), "broadcast sent");
        for request in pending {
            self.send_sender_key_distribution_message(&request.consumer_name);
        }
        Ok(())
    }

    /// Delete the session with `consumer` from memory and persistence.
    ///
    /// Deleting an absent session succeeds.
    ///
    /// # Errors
    ///
    /// `Persistence` if the session store fails.
    pub fn delete_user_session(&self, consumer: &str) -> Result<(), DispatchError> {
        let address = self.consumer_address(consumer);
        self.consumer_locks.with(consumer, || self.bridge.delete_session(&address)).map_err(
            |source| DispatchError::Persistence { consumer: consumer.to_string(), source },
        )
    }

    fn send_message(
        &self,
        plaintext: &[u8],
        consumer: &str,
        message_type: MessageType,
    ) -> Result<(), DispatchError> {
        let delivery =
            self.consumer_locks.with(consumer, || self.deliver(plaintext, consumer, message_type))?;

        // A KEY_DIST push never triggers another push
        if matches!(delivery, Delivery::Rebuilt { subscribed: true })
            && message_type != MessageType::KeyDist
        {
            self.send_sender_key_distribution_message(consumer);
        }
        Ok(())
    }

    /// Runs under the consumer lock.
    fn deliver(
        &self,
        plaintext: &[u8],
        consumer: &str,
        message_type: MessageType,
    ) -> Result<Delivery, DispatchError> {
        let address = self.consumer_address(consumer);

        if !self.bridge.has_session(&address) {
            let bundle = self.fetch_bundle(consumer)?;
            self.bridge.establish_session(&address, &bundle).map_err(|source| {
                DispatchError::SessionCreation { consumer: consumer.to_string(), source }
            })?;
            info!(consumer, "session established");
        }

        let receipt = self.encrypt_and_send(&address, plaintext, message_type)?;
        let observed = self.decode_identity(consumer, &receipt)?;
        if self.bridge.session_remote_identity(&address).as_ref() == Some(&observed) {
            debug!(consumer, %message_type, "message delivered");
            return Ok(Delivery::Delivered);
        }

        info!(consumer, "identity key mismatch, rebuilding session");
        if let Err(error) = self.bridge.delete_session(&address) {
            error!(consumer, %error, "failed to delete stale session");
        }
        // The stale pin goes with its session; the rebuilt session pins anew
        self.bridge.forget_identity(&address);

        let bundle = self.fetch_bundle(consumer)?;
        self.bridge.establish_session(&address, &bundle).map_err(|source| {
            DispatchError::SessionCreation { consumer: consumer.to_string(), source }
        })?;

        // The retry response is not checked for another mismatch
        self.encrypt_and_send(&address, plaintext, message_type)?;
        info!(consumer, "message resent on rebuilt session");

        Ok(Delivery::Rebuilt { subscribed: receipt.subscribed_to_broadcast })
    }

    fn encrypt_and_send(
        &self,
        address: &ProtocolAddress,
        plaintext: &[u8],
        message_type: MessageType,
    ) -> Result<DeliveryReceipt, DispatchError> {
        let consumer = address.name();
        let ciphertext = self
            .bridge
            .encrypt_session(address, plaintext)
            .map_err(|e| DispatchError::send(consumer, e))?;

        self.channel
            .send_message(&B64.encode(ciphertext), consumer, message_type)
            .map_err(|e| DispatchError::send(consumer, e))
    }

    fn fetch_bundle(&self, consumer: &str) -> Result<ConsumerKeyBundle, DispatchError> {
        let prekey_error =
            |source| DispatchError::PrekeyBundle { consumer: consumer.to_string(), source };

        let response = self
            .channel
            .get_consumer_keys(consumer)
            .map_err(|e| prekey_error(PrekeyBundleError::Fetch(e)))?;
        let mut bundle = ConsumerKeyBundle::try_from(&response).map_err(prekey_error)?;

        if bundle.consumer.is_empty() {
            bundle.consumer = consumer.to_string();
        } else if bundle.consumer != consumer {
            return Err(prekey_error(PrekeyBundleError::malformed(
                "username",
                format!("bundle is for {}", bundle.consumer),
            )));
        }
        Ok(bundle)
    }

    /// The identity key the server reports for `consumer`.
    fn decode_identity(
        &self,
        consumer: &str,
        receipt: &DeliveryReceipt,
    ) -> Result<IdentityKey, DispatchError> {
        let malformed = |reason: String| {
            DispatchError::send(consumer, ChannelError::Decode(format!("userIK: {reason}")))
        };

        let key = B64
            .decode(&receipt.identity_key)
            .map(IdentityKey::new)
            .map_err(|e| malformed(e.to_string()))?;
        self.bridge.engine().validate_identity_key(&key).map_err(|e| malformed(e.to_string()))?;
        Ok(key)
    }

    fn try_send_distribution(&self, consumer: &str) -> Result<(), DispatchError> {
        let session = self.complete_broadcast_session()?;
        let Some(message) = session.distribution_message else {
            return Err(self.half_populated("distribution message"));
        };

        debug!(consumer, distribution_id = %session.distribution_id, "pushing distribution message");
        self.send_message(B64.encode(message).as_bytes(), consumer, MessageType::KeyDist)
    }

    /// The persisted broadcast session, if both halves are present.
    fn complete_broadcast_session(&self) -> Result<StoredBroadcastSession, DispatchError> {
        let business = self.bridge.local_address().name();
        let session = self
            .bridge
            .load_broadcast_session()
            .map_err(|e| DispatchError::send(business, e))?
            .ok_or_else(|| {
                DispatchError::send(
                    business,
                    ConsistencyError::MissingBroadcastSession { business: business.to_string() },
                )
            })?;

        if session.sender_key_record.is_none() {
            return Err(self.half_populated("sender key record"));
        }
        if session.distribution_message.is_none() {
            return Err(self.half_populated("distribution message"));
        }
        Ok(session)
    }

    fn half_populated(&self, missing: &'static str) -> DispatchError {
        let business = self.bridge.local_address().name();
        DispatchError::send(
            business,
            ConsistencyError::HalfPopulated { business: business.to_string(), missing },
        )
    }

    fn consumer_address(&self, consumer: &str) -> ProtocolAddress {
        ProtocolAddress::new(consumer, self.config.consumer_device_id)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::DistributionId,
        channel::{ConsumerKeysResponse, KeyDistributionRequest},
        engine::RatchetEngine,
        env::SystemEnv,
        error::SendFailure,
        storage::{ChaoticStorage, MemoryStorage, Persistence},
    };

    /// Server that is never reachable.
    struct Offline;

    impl ServerChannel for Offline {
        fn send_message(
            &self,
            _: &str,
            _: &str,
            _: MessageType,
        ) -> Result<DeliveryReceipt, ChannelError> {
            Err(ChannelError::Transport("offline".to_string()))
        }

        fn send_key_dist_message(&self, _: &str, _: &str) -> Result<(), ChannelError> {
            Err(ChannelError::Transport("offline".to_string()))
        }

        fn send_ads_message(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Vec<KeyDistributionRequest>, ChannelError> {
            Err(ChannelError::Transport("offline".to_string()))
        }

        fn get_consumer_keys(&self, _: &str) -> Result<ConsumerKeysResponse, ChannelError> {
            Err(ChannelError::Transport("offline".to_string()))
        }
    }

    fn dispatcher(persistence: Persistence) -> Dispatcher<RatchetEngine<SystemEnv>, Offline> {
        let engine = RatchetEngine::new(SystemEnv::new());
        let identity = engine.generate_identity();
        let bridge = StoreBridge::new(engine, identity, ProtocolAddress::new("acme", 1), persistence);
        Dispatcher::new(bridge, Offline)
    }

    #[test]
    fn default_consumer_device_id() {
        assert_eq!(DispatcherConfig::default().consumer_device_id, 123);
    }

    #[test]
    fn unreachable_bundle_is_prekey_error() {
        let dispatcher = dispatcher(Persistence::from_backend(MemoryStorage::new()));

        let error = dispatcher.send_message_to_consumer("hi", "bob").unwrap_err();

        assert!(matches!(
            error,
            DispatchError::PrekeyBundle { ref consumer, source: PrekeyBundleError::Fetch(_) }
                if consumer == "bob"
        ));
        assert!(!dispatcher.bridge().has_session(&ProtocolAddress::new("bob", 123)));
    }

    #[test]
    fn ads_without_broadcast_session_fails() {
        let dispatcher = dispatcher(Persistence::from_backend(MemoryStorage::new()));

        let error = dispatcher.send_ads_message("promo").unwrap_err();

        assert_eq!(
            error,
            DispatchError::send(
                "acme",
                ConsistencyError::MissingBroadcastSession { business: "acme".to_string() }
            )
        );
    }

    #[test]
    fn ads_with_missing_sender_key_half_fails() {
        let storage = MemoryStorage::new();
        storage.put_broadcast_session(StoredBroadcastSession {
            name: "acme".to_string(),
            device_id: 1,
            distribution_id: DistributionId::from_random_bytes([1; 16]),
            sender_key_record: None,
            distribution_message: Some(vec![1, 2, 3]),
        });
        let dispatcher = dispatcher(Persistence::from_backend(storage));

        let error = dispatcher.send_ads_message("promo").unwrap_err();

        assert!(matches!(
            error,
            DispatchError::MessageSend {
                source: SendFailure::Consistency(ConsistencyError::HalfPopulated {
                    missing: "sender key record",
                    ..
                }),
                ..
            }
        ));
    }

    #[test]
    fn delete_absent_session_succeeds() {
        let dispatcher = dispatcher(Persistence::from_backend(MemoryStorage::new()));

        dispatcher.delete_user_session("nobody").unwrap();
        dispatcher.delete_user_session("nobody").unwrap();
    }

    #[test]
    fn delete_storage_failure_is_persistence_error() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0).writes_only();
        let dispatcher = dispatcher(Persistence::from_backend(storage));

        let error = dispatcher.delete_user_session("bob").unwrap_err();

        assert!(matches!(error, DispatchError::Persistence { ref consumer, .. } if consumer == "bob"));
        assert!(!error.is_recoverable());
    }
}
