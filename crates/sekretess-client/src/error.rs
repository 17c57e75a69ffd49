//! Client construction errors.

use thiserror::Error;

/// Errors building an [`HttpServerChannel`](crate::HttpServerChannel).
///
/// Per-request failures are reported as
/// [`ChannelError`](sekretess_core::ChannelError) instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// A configured URL could not be parsed
    #[error("invalid {field} url: {reason}")]
    InvalidUrl {
        /// Configuration field
        field: &'static str,
        /// Parser message
        reason: String,
    },
}
