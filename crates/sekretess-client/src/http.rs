//! Blocking [`ServerChannel`] over the business HTTP API.

use sekretess_core::{
    ChannelError, ConsumerKeysResponse, DeliveryReceipt, Environment, KeyDistributionRequest,
    MessageType, ServerChannel, SystemEnv,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};
use url::Url;

use crate::{
    config::ClientConfig,
    error::ClientError,
    token::{PasswordGrant, TokenProvider, TokenSource},
    wire::{SendAdMessageRequest, SendMessageRequest},
};

const API: [&str; 3] = ["api", "v1", "businesses"];

/// Business API client.
///
/// Every request carries a bearer token from the [`TokenProvider`]. A 401
/// drops the cached token so the next request authenticates again.
pub struct HttpServerChannel<S: TokenSource = PasswordGrant, V: Environment = SystemEnv> {
    agent: ureq::Agent,
    base: Url,
    tokens: TokenProvider<S, V>,
}

impl HttpServerChannel {
    /// Build a client authenticating with the password grant.
    ///
    /// # Errors
    ///
    /// `InvalidUrl` if the server or identity-provider URL cannot be parsed.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Url::parse(&config.identity_provider_url).map_err(|e| ClientError::InvalidUrl {
            field: "identity provider",
            reason: e.to_string(),
        })?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.request_timeout)
            .build();
        let tokens = TokenProvider::new(
            PasswordGrant::new(agent.clone(), config),
            SystemEnv::new(),
            config.token_max_age,
        );
        Self::with_tokens(agent, config, tokens)
    }
}

impl<S: TokenSource, V: Environment> HttpServerChannel<S, V> {
    /// Build a client with an explicit agent and token provider.
    ///
    /// # Errors
    ///
    /// `InvalidUrl` if the server URL cannot be parsed or cannot carry a path.
    pub fn with_tokens(
        agent: ureq::Agent,
        config: &ClientConfig,
        tokens: TokenProvider<S, V>,
    ) -> Result<Self, ClientError> {
        let base = Url::parse(&config.server_url)
            .map_err(|e| ClientError::InvalidUrl { field: "server", reason: e.to_string() })?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl {
                field: "server",
                reason: "url cannot carry a path".to_string(),
            });
        }
        Ok(Self { agent, base, tokens })
    }

    /// The token provider.
    pub fn tokens(&self) -> &TokenProvider<S, V> {
        &self.tokens
    }

    /// `{server}/api/v1/businesses/{segments...}`, each segment percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API).extend(segments);
        }
        url
    }

    fn post<B: Serialize>(
        &self,
        segments: &[&str],
        body: &B,
        expected: u16,
    ) -> Result<ureq::Response, ChannelError> {
        let url = self.endpoint(segments);
        let request = self.authorize(self.agent.post(url.as_str()))?;
        self.check(url, request.send_json(body), expected)
    }

    fn get(&self, segments: &[&str], expected: u16) -> Result<ureq::Response, ChannelError> {
        let url = self.endpoint(segments);
        let request = self.authorize(self.agent.get(url.as_str()))?;
        self.check(url, request.call(), expected)
    }

    fn authorize(&self, request: ureq::Request) -> Result<ureq::Request, ChannelError> {
        let token = self.tokens.token()?;
        Ok(request
            .set("content-type", "application/json")
            .set("authorization", &format!("Bearer {token}")))
    }

    fn check(
        &self,
        url: Url,
        result: Result<ureq::Response, ureq::Error>,
        expected: u16,
    ) -> Result<ureq::Response, ChannelError> {
        let status = match result {
            Ok(response) if response.status() == expected => return Ok(response),
            Ok(response) => response.status(),
            Err(ureq::Error::Status(status, _)) => status,
            Err(ureq::Error::Transport(transport)) => {
                return Err(ChannelError::Transport(transport.to_string()));
            },
        };

        if status == 401 {
            self.tokens.invalidate();
        }
        Err(ChannelError::Status { endpoint: url.path().to_string(), status })
    }
}

fn decode<T: DeserializeOwned>(response: ureq::Response) -> Result<T, ChannelError> {
    response.into_json().map_err(|e| ChannelError::Decode(e.to_string()))
}

impl<S: TokenSource, V: Environment> ServerChannel for HttpServerChannel<S, V> {
    fn send_message(
        &self,
        ciphertext: &str,
        consumer: &str,
        message_type: MessageType,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let body = SendMessageRequest {
            text: ciphertext,
            consumer_exchange: consumer,
            message_type: Some(message_type),
        };
        let receipt = decode(self.post(&["messages"], &body, 200)?)?;
        info!(consumer, %message_type, "message forwarded");
        Ok(receipt)
    }

    fn send_key_dist_message(&self, payload: &str, consumer: &str) -> Result<(), ChannelError> {
        let body =
            SendMessageRequest { text: payload, consumer_exchange: consumer, message_type: None };
        self.post(&["messages", "distributions"], &body, 200)?;
        info!(consumer, "key distribution message forwarded");
        Ok(())
    }

    fn send_ads_message(
        &self,
        ciphertext: &str,
        business: &str,
    ) -> Result<Vec<KeyDistributionRequest>, ChannelError> {
        let body = SendAdMessageRequest { text: ciphertext, business_exchange: business };
        let pending: Vec<KeyDistributionRequest> =
            decode(self.post(&["messages", "ads"], &body, 202)?)?;
        info!(business, pending = pending.len(), "broadcast forwarded");
        Ok(pending)
    }

    fn get_consumer_keys(&self, consumer: &str) -> Result<ConsumerKeysResponse, ChannelError> {
        let keys: ConsumerKeysResponse =
            decode(self.get(&["consumers", consumer, "key-bundles"], 200)?)?;
        debug!(consumer, reg_id = keys.reg_id, "fetched consumer key bundle");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Fixed;

    impl TokenSource for Fixed {
        fn request_token(&self) -> Result<String, ChannelError> {
            Ok("e30.e30.c2ln".to_string())
        }
    }

    fn channel(server_url: &str) -> Result<HttpServerChannel<Fixed>, ClientError> {
        let config = ClientConfig { server_url: server_url.to_string(), ..ClientConfig::default() };
        let tokens = TokenProvider::new(Fixed, SystemEnv::new(), Duration::from_secs(60));
        HttpServerChannel::with_tokens(ureq::agent(), &config, tokens)
    }

    #[test]
    fn endpoints_follow_business_api() {
        let channel = channel("https://business.example.com").unwrap();

        assert_eq!(
            channel.endpoint(&["messages", "distributions"]).as_str(),
            "https://business.example.com/api/v1/businesses/messages/distributions"
        );
        assert_eq!(
            channel.endpoint(&["consumers", "alice", "key-bundles"]).path(),
            "/api/v1/businesses/consumers/alice/key-bundles"
        );
    }

    #[test]
    fn consumer_names_are_percent_encoded() {
        let channel = channel("https://business.example.com/").unwrap();

        assert_eq!(
            channel.endpoint(&["consumers", "a/b?c", "key-bundles"]).path(),
            "/api/v1/businesses/consumers/a%2Fb%3Fc/key-bundles"
        );
    }

    #[test]
    fn rejects_unusable_server_url() {
        assert!(matches!(channel("not a url"), Err(ClientError::InvalidUrl { field: "server", .. })));
        assert!(matches!(
            channel("mailto:ops@example.com"),
            Err(ClientError::InvalidUrl { field: "server", .. })
        ));
    }
}
