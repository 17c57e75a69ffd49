//! Capability contract for the backend server.
//!
//! The core never builds requests itself. Implementations own transport,
//! authentication and retries; the core only sees typed responses and
//! [`ChannelError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message type tag sent alongside every direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Application text for one consumer
    Private,
    /// Broadcast distribution message wrapped in a direct message
    KeyDist,
}

impl MessageType {
    /// Wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "PRIVATE",
            Self::KeyDist => "KEY_DIST",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server response to a delivered direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Base64 identity key the server currently associates with the consumer
    #[serde(rename = "userIK")]
    pub identity_key: String,
    /// Whether the consumer is subscribed to broadcasts
    #[serde(rename = "subscribedToAdMessages")]
    pub subscribed_to_broadcast: bool,
}

/// A consumer that needs the broadcast distribution message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDistributionRequest {
    /// Consumer name
    #[serde(rename = "consumerName")]
    pub consumer_name: String,
}

/// A consumer's published key bundle as returned by the server.
///
/// Every key field is base64. `opk` is `"<id>:<base64>"`; the prekey ids are
/// decimal strings. Parsed into a
/// [`ConsumerKeyBundle`](crate::bundle::ConsumerKeyBundle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerKeysResponse {
    /// Consumer name; empty when the server omits it
    #[serde(default)]
    pub username: String,
    /// Identity key
    pub ik: String,
    /// One-time prekey, `"<id>:<base64>"`
    pub opk: String,
    /// Registration id
    #[serde(rename = "regID")]
    pub reg_id: u32,
    /// Signed prekey
    pub spk: String,
    /// Signed prekey id
    #[serde(rename = "spkID")]
    pub spk_id: String,
    /// Signature over the signed prekey
    #[serde(rename = "spkSignature")]
    pub spk_signature: String,
    /// Post-quantum signed prekey
    #[serde(rename = "pqSpk")]
    pub pq_spk: String,
    /// Post-quantum signed prekey id
    #[serde(rename = "pqSpkID")]
    pub pq_spk_id: String,
    /// Signature over the post-quantum prekey
    #[serde(rename = "pqSpkSignature")]
    pub pq_spk_signature: String,
}

/// Errors surfaced by a [`ServerChannel`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Server answered with an unexpected status
    #[error("{endpoint} returned status {status}")]
    Status {
        /// Endpoint path
        endpoint: String,
        /// HTTP status code
        status: u16,
    },

    /// Connection, TLS or timeout failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("malformed response: {0}")]
    Decode(String),

    /// Could not obtain an access token
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Backend operations the dispatcher depends on.
///
/// Calls are blocking; any non-success status is an error.
pub trait ServerChannel: Send + Sync {
    /// Deliver a base64 ciphertext to `consumer`.
    fn send_message(
        &self,
        ciphertext: &str,
        consumer: &str,
        message_type: MessageType,
    ) -> Result<DeliveryReceipt, ChannelError>;

    /// Deliver a base64 distribution payload to `consumer` out of band.
    fn send_key_dist_message(&self, payload: &str, consumer: &str) -> Result<(), ChannelError>;

    /// Publish a base64 broadcast ciphertext under `business`.
    ///
    /// Returns the consumers that still need the distribution message.
    fn send_ads_message(
        &self,
        ciphertext: &str,
        business: &str,
    ) -> Result<Vec<KeyDistributionRequest>, ChannelError>;

    /// Fetch `consumer`'s published key bundle.
    fn get_consumer_keys(&self, consumer: &str) -> Result<ConsumerKeysResponse, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_wire_names() {
        assert_eq!(MessageType::Private.to_string(), "PRIVATE");
        assert_eq!(MessageType::KeyDist.as_str(), "KEY_DIST");
    }
}
