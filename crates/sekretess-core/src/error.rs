//! Error taxonomy for the session lifecycle and dispatch protocol.
//!
//! Every failure a caller can observe is a [`DispatchError`] carrying the
//! offending consumer or business name. Identity mismatch is not an error;
//! it is handled inline by the dispatcher.

use std::fmt;

use thiserror::Error;

use crate::{address::DistributionId, channel::ChannelError, storage::StorageError};

/// Errors raised by a crypto engine while establishing a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyAgreementError {
    /// Key material has the wrong length or is not a valid point
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A prekey signature did not verify under the consumer identity
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The bundle identity differs from the pinned one for this address
    #[error("untrusted identity for {address}")]
    UntrustedIdentity {
        /// Remote address, formatted as `name.device`
        address: String,
    },

    /// Diffie-Hellman output was all zeros
    #[error("key agreement was not contributory")]
    NonContributory,
}

/// Errors raised by a crypto engine outside session establishment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No cached session for the address
    #[error("no session for {0}")]
    NoSession(String),

    /// No cached sender key for the distribution id
    #[error("no sender key for distribution {0}")]
    NoSenderKey(DistributionId),

    /// Serialized state could not be encoded or decoded
    #[error("state encoding failed: {0}")]
    Encoding(String),

    /// Encryption primitive failed (e.g. ratchet exhausted)
    #[error("encryption failed: {0}")]
    Crypto(String),
}

/// Malformed or unreachable consumer key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrekeyBundleError {
    /// The server could not provide the bundle
    #[error("failed to fetch key bundle: {0}")]
    Fetch(#[source] ChannelError),

    /// A bundle field could not be parsed
    #[error("malformed key bundle field {field}: {reason}")]
    Malformed {
        /// Wire name of the offending field
        field: &'static str,
        /// Parser message
        reason: String,
    },
}

impl PrekeyBundleError {
    pub(crate) fn malformed(field: &'static str, reason: impl fmt::Display) -> Self {
        Self::Malformed { field, reason: reason.to_string() }
    }
}

/// The broadcast session is missing or only half populated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// No broadcast session was ever persisted for the business
    #[error("no broadcast session for {business}")]
    MissingBroadcastSession {
        /// Business name
        business: String,
    },

    /// One half of the broadcast session was never written
    #[error("broadcast session for {business} has no {missing}")]
    HalfPopulated {
        /// Business name
        business: String,
        /// Missing half: "sender key record" or "distribution message"
        missing: &'static str,
    },

    /// The persisted sender key is not loaded in memory
    #[error("sender key for distribution {distribution_id} is not loaded")]
    SenderKeyNotLoaded {
        /// Distribution id of the persisted session
        distribution_id: DistributionId,
    },
}

/// Cause of a failed send.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Transport or status failure talking to the server
    #[error(transparent)]
    Delivery(#[from] ChannelError),

    /// Broadcast session invariant does not hold
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    /// Crypto engine failed to encrypt
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Persistence read failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure of a dispatcher operation.
///
/// All variants except `Persistence` are recoverable at the call site: the
/// caller decides whether to retry, log or drop the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Consumer key bundle could not be fetched or parsed
    #[error("prekey bundle for {consumer} unavailable: {source}")]
    PrekeyBundle {
        /// Consumer name
        consumer: String,
        /// Underlying cause
        source: PrekeyBundleError,
    },

    /// Session could not be established from the bundle
    #[error("session creation with {consumer} failed: {source}")]
    SessionCreation {
        /// Consumer name
        consumer: String,
        /// Underlying cause
        source: KeyAgreementError,
    },

    /// Encryption, consistency or delivery failed
    #[error("message send to {recipient} failed: {source}")]
    MessageSend {
        /// Consumer name, or business name for broadcasts
        recipient: String,
        /// Underlying cause
        source: SendFailure,
    },

    /// Durable session state could not be removed
    #[error("session deletion for {consumer} failed: {source}")]
    Persistence {
        /// Consumer name
        consumer: String,
        /// Underlying cause
        source: StorageError,
    },
}

impl DispatchError {
    pub(crate) fn send(recipient: &str, source: impl Into<SendFailure>) -> Self {
        Self::MessageSend { recipient: recipient.to_string(), source: source.into() }
    }

    /// Consumer or business name the failure is about.
    pub fn name(&self) -> &str {
        match self {
            Self::PrekeyBundle { consumer, .. }
            | Self::SessionCreation { consumer, .. }
            | Self::Persistence { consumer, .. } => consumer,
            Self::MessageSend { recipient, .. } => recipient,
        }
    }

    /// Whether the caller can reasonably retry or drop the message.
    ///
    /// `Persistence` means durable state may disagree with memory and needs
    /// operator attention.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Persistence { .. })
    }
}

/// Startup failure of the store initializer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// Persistence read or write failed
    #[error("storage error during initialization: {0}")]
    Storage(#[from] StorageError),

    /// Crypto engine could not create or restore state
    #[error("engine error during initialization: {0}")]
    Engine(#[from] EngineError),

    /// The persisted identity could not be restored
    #[error("persisted identity for {name} is corrupt: {source}")]
    CorruptIdentity {
        /// Business name
        name: String,
        /// Underlying cause
        source: EngineError,
    },
}
