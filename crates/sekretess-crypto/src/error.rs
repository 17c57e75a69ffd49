//! Error types for the cryptographic primitives.

use thiserror::Error;

/// Errors raised by the primitives in this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Requested generation is behind the ratchet or too far ahead of it
    #[error("ratchet cannot reach generation {requested} from {current}")]
    RatchetTooFarBehind {
        /// Current ratchet generation
        current: u32,
        /// Requested generation
        requested: u32,
    },

    /// Ratchet reached the maximum generation
    #[error("ratchet generation overflow at {current}")]
    GenerationOverflow {
        /// Generation at which overflow was detected
        current: u32,
    },

    /// AEAD authentication failed or the key does not match the payload
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Human-readable cause
        reason: String,
    },

    /// Key material has the wrong length or is not a valid point
    #[error("invalid {kind} key: {reason}")]
    InvalidKey {
        /// Which key was rejected (e.g. "identity", "signed prekey")
        kind: &'static str,
        /// Human-readable cause
        reason: String,
    },

    /// Signature did not verify under the expected public key
    #[error("invalid {kind} signature")]
    InvalidSignature {
        /// What the signature covered
        kind: &'static str,
    },

    /// Diffie-Hellman produced an all-zero output (low-order point)
    #[error("key agreement was not contributory")]
    NonContributory,
}
