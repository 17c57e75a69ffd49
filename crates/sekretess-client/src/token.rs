//! Access-token acquisition and caching.
//!
//! Tokens come from the identity provider's password grant. A cached token is
//! reused until its JWT `exp` passes or it reaches the configured maximum age,
//! whichever comes first.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sekretess_core::{ChannelError, Environment, SystemEnv};
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;

/// Source of fresh access tokens.
pub trait TokenSource: Send + Sync {
    /// Request a new access token.
    fn request_token(&self) -> Result<String, ChannelError>;
}

/// OAuth password grant against the identity provider.
pub struct PasswordGrant {
    agent: ureq::Agent,
    url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl PasswordGrant {
    /// Build a grant from the identity-provider settings in `config`.
    pub fn new(agent: ureq::Agent, config: &ClientConfig) -> Self {
        Self {
            agent,
            url: config.identity_provider_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl TokenSource for PasswordGrant {
    fn request_token(&self) -> Result<String, ChannelError> {
        let mut form = vec![("client_id", self.client_id.as_str()), ("grant_type", "password")];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = match self.agent.post(&self.url).send_form(&form) {
            Ok(response) if response.status() == 200 => response,
            Ok(response) => {
                return Err(ChannelError::Auth(format!(
                    "token endpoint returned status {}",
                    response.status()
                )));
            },
            Err(ureq::Error::Status(status, _)) => {
                return Err(ChannelError::Auth(format!("token endpoint returned status {status}")));
            },
            Err(ureq::Error::Transport(transport)) => {
                return Err(ChannelError::Transport(transport.to_string()));
            },
        };

        let body: TokenResponse =
            response.into_json().map_err(|e| ChannelError::Auth(format!("token response: {e}")))?;
        Ok(body.access_token)
    }
}

/// Claims read from the access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since the Unix epoch
    pub exp: Option<u64>,
    /// Authenticated user name
    pub preferred_username: Option<String>,
}

/// Decode the claims of a JWT without verifying its signature.
///
/// The token is only inspected for caching; the server verifies it.
pub fn decode_claims(token: &str) -> Result<Claims, ChannelError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ChannelError::Auth("access token is not a JWT".to_string()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ChannelError::Auth(format!("access token payload: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ChannelError::Auth(format!("access token claims: {e}")))
}

struct CachedToken {
    token: String,
    claims: Claims,
    fetched_at: u64,
}

/// Caching bearer-token provider.
///
/// Concurrent callers share one refresh: the cache lock is held while a new
/// token is requested.
pub struct TokenProvider<S: TokenSource, V: Environment = SystemEnv> {
    source: S,
    env: V,
    max_age: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl<S: TokenSource, V: Environment> TokenProvider<S, V> {
    /// Create a provider refreshing tokens older than `max_age`.
    pub fn new(source: S, env: V, max_age: Duration) -> Self {
        Self { source, env, max_age, cached: Mutex::new(None) }
    }

    /// A valid access token, refreshed if expired or too old.
    pub fn token(&self) -> Result<String, ChannelError> {
        self.with_fresh(|cached| cached.token.clone())
    }

    /// `preferred_username` of the current token.
    pub fn username(&self) -> Result<Option<String>, ChannelError> {
        self.with_fresh(|cached| cached.claims.preferred_username.clone())
    }

    /// Drop the cached token; the next call requests a new one.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn with_fresh<R>(&self, read: impl FnOnce(&CachedToken) -> R) -> Result<R, ChannelError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.env.wall_clock_secs();

        if let Some(token) = cached.as_ref().filter(|token| self.is_fresh(token, now)) {
            return Ok(read(token));
        }

        let token = self.source.request_token()?;
        let claims = decode_claims(&token)?;
        debug!(exp = ?claims.exp, "fetched access token");

        Ok(read(cached.insert(CachedToken { token, claims, fetched_at: now })))
    }

    fn is_fresh(&self, token: &CachedToken, now: u64) -> bool {
        let young = now.saturating_sub(token.fetched_at) < self.max_age.as_secs();
        let unexpired = token.claims.exp.is_none_or(|exp| now < exp);
        young && unexpired
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Clock(Arc<AtomicU64>);

    impl Clock {
        fn set(&self, secs: u64) {
            self.0.store(secs, Ordering::Relaxed);
        }
    }

    impl Environment for Clock {
        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0);
        }

        fn wall_clock_secs(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    /// Issues JWTs expiring `lifetime` seconds after the current clock.
    struct Issuer {
        clock: Clock,
        lifetime: u64,
        issued: AtomicUsize,
    }

    impl TokenSource for Issuer {
        fn request_token(&self) -> Result<String, ChannelError> {
            let n = self.issued.fetch_add(1, Ordering::Relaxed);
            let exp = self.clock.wall_clock_secs() + self.lifetime;
            Ok(jwt(&format!(r#"{{"exp":{exp},"preferred_username":"acme","n":{n}}}"#)))
        }
    }

    fn jwt(claims: &str) -> String {
        format!("eyJhbGciOiJub25lIn0.{}.c2ln", URL_SAFE_NO_PAD.encode(claims))
    }

    fn provider(lifetime: u64) -> (TokenProvider<Issuer, Clock>, Clock) {
        let clock = Clock::default();
        clock.set(1_000);
        let issuer = Issuer { clock: clock.clone(), lifetime, issued: AtomicUsize::new(0) };
        (TokenProvider::new(issuer, clock.clone(), Duration::from_secs(22 * 60)), clock)
    }

    #[test]
    fn decodes_claims() {
        let claims = decode_claims(&jwt(r#"{"exp":42,"preferred_username":"acme"}"#)).unwrap();

        assert_eq!(claims.exp, Some(42));
        assert_eq!(claims.preferred_username.as_deref(), Some("acme"));
    }

    #[test]
    fn rejects_non_jwt() {
        assert!(matches!(decode_claims("opaque-token"), Err(ChannelError::Auth(_))));
        assert!(matches!(decode_claims("a.!!!.c"), Err(ChannelError::Auth(_))));
    }

    #[test]
    fn reuses_token_until_expiry() {
        let (provider, clock) = provider(300);

        let first = provider.token().unwrap();
        clock.set(1_299);
        assert_eq!(provider.token().unwrap(), first);

        clock.set(1_300);
        assert_ne!(provider.token().unwrap(), first);
        assert_eq!(provider.source.issued.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn refreshes_after_max_age() {
        let (provider, clock) = provider(24 * 3600);

        let first = provider.token().unwrap();
        clock.set(1_000 + 22 * 60);

        assert_ne!(provider.token().unwrap(), first);
    }

    #[test]
    fn invalidate_forces_refresh() {
        let (provider, _clock) = provider(300);

        let first = provider.token().unwrap();
        provider.invalidate();

        assert_ne!(provider.token().unwrap(), first);
        assert_eq!(provider.username().unwrap().as_deref(), Some("acme"));
    }
}
