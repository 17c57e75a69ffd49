//! Sekretess Cryptographic Primitives
//!
//! Building blocks for the reference crypto engine. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! A direct session starts from a consumer's published prekeys. The business
//! signs a fresh ephemeral key with its identity, agrees on shared secrets
//! with the consumer's signed and one-time prekeys, and derives a chain seed
//! plus a channel id. A symmetric ratchet then produces one-time message keys.
//!
//! ```text
//! Ephemeral X25519 ─┬─ DH(signed prekey)
//!                   └─ DH(one-time prekey)
//!        │
//!        ▼
//! HKDF(identities, PQ prekey hash) → Chain Seed + Channel Id
//!        │
//!        ▼
//! Symmetric Ratchet → Message Keys
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! Broadcast (sender-key) sessions skip the agreement step: the chain seed is
//! random, the channel id is the distribution id, and every message is signed
//! with a per-session Ed25519 key that consumers learn from the distribution
//! message.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Ratchet advancement: Old chain keys are zeroized after deriving next key
//! - Message key disposal: Keys are zeroized on drop
//!
//! Authenticity:
//! - Prekey signatures are verified against the consumer identity before use
//! - The ephemeral key is signed by the business identity
//! - XChaCha20-Poly1305 AEAD binds each payload to (channel, generation)
//! - Low-order X25519 points are rejected

#![forbid(unsafe_code)]

pub mod aead;
pub mod agreement;
pub mod derivation;
pub mod error;
pub mod identity;
pub mod ratchet;

pub use aead::{NONCE_RANDOM_SIZE, SealedPayload, open, seal};
pub use agreement::{Initiation, PreKeyPair, RemotePrekeys, ResponderKeys, initiate, respond};
pub use derivation::{SessionSecrets, derive_session_secrets};
pub use error::CryptoError;
pub use identity::{PUBLIC_KEY_LEN, SIGNATURE_LEN, SigningKeyPair, verify_signature};
pub use ratchet::{MessageKey, SymmetricRatchet};
