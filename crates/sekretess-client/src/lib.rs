//! Sekretess HTTP client.
//!
//! Blocking implementation of [`ServerChannel`](sekretess_core::ServerChannel)
//! against the Sekretess business API, plus bearer-token acquisition from the
//! identity provider.
//!
//! # Components
//!
//! - [`HttpServerChannel`]: Sends direct, key-distribution and broadcast
//!   messages and fetches consumer key bundles
//! - [`TokenProvider`]: Caches an access token and refreshes it on JWT expiry
//!   or after a maximum age
//! - [`ClientConfig`]: Endpoints, credentials and timeouts

#![forbid(unsafe_code)]

mod config;
mod error;
mod http;
pub mod token;
mod wire;

pub use config::{ClientConfig, DEFAULT_CLIENT_ID};
pub use error::ClientError;
pub use http::HttpServerChannel;
pub use token::{PasswordGrant, TokenProvider, TokenSource};
pub use wire::{SendAdMessageRequest, SendMessageRequest};
