//! Scripted in-process server.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use sekretess_core::{
    ChannelError, ConsumerKeysResponse, DeliveryReceipt, KeyDistributionRequest, MessageType,
    ServerChannel,
};
use tracing::trace;

/// Server endpoints, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Direct messages
    Messages,
    /// Out-of-band key distribution
    Distributions,
    /// Broadcasts
    Ads,
    /// Consumer key bundles
    KeyBundles,
}

/// A recorded direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Consumer name
    pub consumer: String,
    /// Base64 ciphertext
    pub ciphertext: String,
    /// Message type tag
    pub message_type: MessageType,
}

/// A recorded broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAd {
    /// Business name
    pub business: String,
    /// Base64 ciphertext
    pub ciphertext: String,
}

#[derive(Default)]
struct Inner {
    bundles: HashMap<String, ConsumerKeysResponse>,
    reported_identity: HashMap<String, String>,
    subscribed: HashSet<String>,
    pending_distribution: Vec<String>,
    failures: HashMap<Endpoint, ChannelError>,
    fetches: HashMap<String, usize>,
    messages: Vec<SentMessage>,
    key_distributions: Vec<(String, String)>,
    ads: Vec<SentAd>,
}

/// [`ServerChannel`] double.
///
/// Reports each consumer's published identity key unless told otherwise.
/// Clones share state, so a test keeps one clone for scripting and
/// inspection while the dispatcher owns another.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedChannel {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) `response` as the consumer's key bundle.
    pub fn publish(&self, response: ConsumerKeysResponse) {
        self.lock().bundles.insert(response.username.clone(), response);
    }

    /// Serve `response` when `consumer`'s key bundle is requested, whatever
    /// name it carries.
    pub fn publish_as(&self, consumer: &str, response: ConsumerKeysResponse) {
        self.lock().bundles.insert(consumer.to_string(), response);
    }

    /// Report `identity_b64` in delivery receipts for `consumer` instead of
    /// the published identity key.
    pub fn report_identity(&self, consumer: &str, identity_b64: impl Into<String>) {
        self.lock().reported_identity.insert(consumer.to_string(), identity_b64.into());
    }

    /// Mark `consumer` as subscribed to broadcasts in delivery receipts.
    pub fn set_subscribed(&self, consumer: &str, subscribed: bool) {
        let mut inner = self.lock();
        if subscribed {
            inner.subscribed.insert(consumer.to_string());
        } else {
            inner.subscribed.remove(consumer);
        }
    }

    /// Report `consumer` as needing the distribution message in the next
    /// broadcast response.
    pub fn queue_key_distribution(&self, consumer: &str) {
        self.lock().pending_distribution.push(consumer.to_string());
    }

    /// Fail every call to `endpoint` with `error` until [`heal`](Self::heal).
    pub fn fail(&self, endpoint: Endpoint, error: ChannelError) {
        self.lock().failures.insert(endpoint, error);
    }

    /// Stop failing `endpoint`.
    pub fn heal(&self, endpoint: Endpoint) {
        self.lock().failures.remove(&endpoint);
    }

    /// Number of key-bundle fetches for `consumer`.
    pub fn fetch_count(&self, consumer: &str) -> usize {
        self.lock().fetches.get(consumer).copied().unwrap_or(0)
    }

    /// Every delivered direct message, in order.
    pub fn messages(&self) -> Vec<SentMessage> {
        self.lock().messages.clone()
    }

    /// Delivered direct messages for `consumer`, in order.
    pub fn messages_to(&self, consumer: &str) -> Vec<SentMessage> {
        self.lock().messages.iter().filter(|m| m.consumer == consumer).cloned().collect()
    }

    /// Every out-of-band key distribution as (consumer, payload).
    pub fn key_distributions(&self) -> Vec<(String, String)> {
        self.lock().key_distributions.clone()
    }

    /// Every published broadcast, in order.
    pub fn ads(&self) -> Vec<SentAd> {
        self.lock().ads.clone()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("Mutex poisoned")
    }
}

impl Inner {
    fn check(&self, endpoint: Endpoint) -> Result<(), ChannelError> {
        self.failures.get(&endpoint).map_or(Ok(()), |error| Err(error.clone()))
    }
}

fn not_found(endpoint: &str) -> ChannelError {
    ChannelError::Status { endpoint: endpoint.to_string(), status: 404 }
}

impl ServerChannel for ScriptedChannel {
    fn send_message(
        &self,
        ciphertext: &str,
        consumer: &str,
        message_type: MessageType,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let mut inner = self.lock();
        inner.check(Endpoint::Messages)?;

        let identity_key = match inner.reported_identity.get(consumer) {
            Some(reported) => reported.clone(),
            None => inner
                .bundles
                .get(consumer)
                .map(|bundle| bundle.ik.clone())
                .ok_or_else(|| not_found("/api/v1/businesses/messages"))?,
        };
        let subscribed_to_broadcast = inner.subscribed.contains(consumer);

        trace!(consumer, %message_type, "recorded direct message");
        inner.messages.push(SentMessage {
            consumer: consumer.to_string(),
            ciphertext: ciphertext.to_string(),
            message_type,
        });
        Ok(DeliveryReceipt { identity_key, subscribed_to_broadcast })
    }

    fn send_key_dist_message(&self, payload: &str, consumer: &str) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        inner.check(Endpoint::Distributions)?;
        inner.key_distributions.push((consumer.to_string(), payload.to_string()));
        Ok(())
    }

    fn send_ads_message(
        &self,
        ciphertext: &str,
        business: &str,
    ) -> Result<Vec<KeyDistributionRequest>, ChannelError> {
        let mut inner = self.lock();
        inner.check(Endpoint::Ads)?;

        inner.ads.push(SentAd { business: business.to_string(), ciphertext: ciphertext.to_string() });
        Ok(inner
            .pending_distribution
            .drain(..)
            .map(|consumer_name| KeyDistributionRequest { consumer_name })
            .collect())
    }

    fn get_consumer_keys(&self, consumer: &str) -> Result<ConsumerKeysResponse, ChannelError> {
        let mut inner = self.lock();
        *inner.fetches.entry(consumer.to_string()).or_default() += 1;
        inner.check(Endpoint::KeyBundles)?;

        inner.bundles.get(consumer).cloned().ok_or_else(|| {
            not_found(&format!("/api/v1/businesses/consumers/{consumer}/key-bundles"))
        })
    }
}
