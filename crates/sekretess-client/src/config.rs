//! Client configuration.

use std::time::Duration;

/// Identity-provider client id the business authenticates as.
pub const DEFAULT_CLIENT_ID: &str = "business_client";

/// Endpoints, credentials and timeouts for [`HttpServerChannel`](crate::HttpServerChannel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Business server base URL, e.g. `https://business.sekretess.io`
    pub server_url: String,
    /// Identity-provider token endpoint
    pub identity_provider_url: String,
    /// Identity-provider client id
    pub client_id: String,
    /// Optional client secret, sent with the password grant
    pub client_secret: Option<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Cached tokens are refreshed after this age even if not yet expired
    pub token_max_age: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            identity_provider_url: "http://localhost:8081/token".to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            token_max_age: Duration::from_secs(22 * 60),
        }
    }
}
