//! Sekretess business core.
//!
//! Session lifecycle and dispatch protocol for a business that exchanges
//! end-to-end-encrypted messages with consumers and broadcasts encrypted
//! announcements to subscribers.
//!
//! # Architecture
//!
//! ```text
//! StoreInitializer ──builds──▶ StoreBridge ◀──uses── Dispatcher ──▶ ServerChannel
//!                                  │  │
//!                        CryptoEngine  Persistence
//!                                      (identity, session, broadcast stores)
//! ```
//!
//! The crypto engine, the server channel and the persistence backends are
//! capabilities injected by the caller. [`RatchetEngine`] is the reference
//! engine; [`MemoryStorage`] and [`RedbStorage`] are the reference backends.
//!
//! # Components
//!
//! - [`StoreInitializer`]: Loads or creates the business identity, rehydrates
//!   sessions and ensures a complete broadcast session
//! - [`StoreBridge`]: Caches engine state and mirrors every mutation to
//!   persistence, surfacing failures as [`PersistenceWarning`]s
//! - [`Dispatcher`]: Direct sends with one-shot identity-mismatch retry,
//!   broadcasts and distribution-message pushes

#![forbid(unsafe_code)]

pub mod address;
pub mod bridge;
pub mod bundle;
pub mod channel;
pub mod dispatcher;
pub mod engine;
pub mod env;
pub mod error;
pub mod initializer;
mod keyed_lock;
pub mod storage;

pub use address::{DistributionId, IdentityKey, LocalIdentity, ProtocolAddress};
pub use bridge::{PersistenceOp, PersistenceWarning, StoreBridge};
pub use bundle::{ConsumerKeyBundle, PreKey, SignedPreKey};
pub use channel::{
    ChannelError, ConsumerKeysResponse, DeliveryReceipt, KeyDistributionRequest, MessageType,
    ServerChannel,
};
pub use dispatcher::{DEFAULT_CONSUMER_DEVICE_ID, Dispatcher, DispatcherConfig};
pub use engine::{CryptoEngine, RatchetEngine};
pub use env::{Environment, SystemEnv};
pub use error::{
    ConsistencyError, DispatchError, EngineError, InitError, KeyAgreementError, PrekeyBundleError,
    SendFailure,
};
pub use initializer::StoreInitializer;
pub use storage::{
    BroadcastSessionStore, ChaoticStorage, IdentityStore, MemoryStorage, Persistence, RedbStorage,
    SessionStore, StorageError, StoredBroadcastSession, StoredIdentity, StoredSession,
};
