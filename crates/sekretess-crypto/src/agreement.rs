//! Prekey agreement between a business (initiator) and a consumer
//! (responder).
//!
//! The initiator never holds consumer secrets: it verifies the consumer's
//! prekey signatures, performs X25519 with a fresh ephemeral key and signs
//! that ephemeral key with its identity so the consumer can authenticate the
//! session without a further round trip.

use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::{
    derivation::{SessionSecrets, derive_session_secrets},
    error::CryptoError,
    identity::{PUBLIC_KEY_LEN, SIGNATURE_LEN, SigningKeyPair, verify_signature},
};

/// X25519 prekey pair held by a consumer.
pub struct PreKeyPair {
    secret: StaticSecret,
}

impl PreKeyPair {
    /// Build a prekey pair from caller-provided random bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { secret: StaticSecret::from(seed) }
    }

    /// Public half, as published in a key bundle.
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }
}

/// A consumer's published prekey material, as seen by the initiator.
#[derive(Debug, Clone, Copy)]
pub struct RemotePrekeys<'a> {
    /// Consumer identity (Ed25519 public key)
    pub identity_key: &'a [u8],
    /// Signed X25519 prekey
    pub signed_prekey: &'a [u8],
    /// Identity signature over `signed_prekey`
    pub signed_prekey_signature: &'a [u8],
    /// Optional one-time X25519 prekey
    pub one_time_prekey: Option<&'a [u8]>,
    /// Post-quantum prekey, bound into the transcript
    pub pq_prekey: &'a [u8],
    /// Identity signature over `pq_prekey`
    pub pq_prekey_signature: &'a [u8],
}

/// Result of [`initiate`]: the shared secrets plus what the responder needs.
pub struct Initiation {
    /// Secrets for the new session
    pub secrets: SessionSecrets,
    /// Ephemeral public key to send to the responder
    pub ephemeral_public: [u8; 32],
    /// Initiator identity signature over `ephemeral_public || responder identity`
    pub ephemeral_signature: [u8; SIGNATURE_LEN],
}

/// Consumer-side secrets used by [`respond`].
pub struct ResponderKeys<'a> {
    /// Consumer identity
    pub identity: &'a SigningKeyPair,
    /// Signed prekey the initiator used
    pub signed_prekey: &'a PreKeyPair,
    /// One-time prekey the initiator used, if any
    pub one_time_prekey: Option<&'a PreKeyPair>,
    /// Post-quantum prekey the initiator bound
    pub pq_prekey: &'a [u8],
}

/// Agree on session secrets with a consumer's published prekeys.
///
/// # Errors
///
/// - `InvalidKey`: malformed identity or prekey
/// - `InvalidSignature`: a prekey is not signed by the consumer identity
/// - `NonContributory`: a prekey is a low-order point
pub fn initiate(
    local: &SigningKeyPair,
    remote: &RemotePrekeys<'_>,
    ephemeral_seed: [u8; 32],
) -> Result<Initiation, CryptoError> {
    let remote_identity = fixed_key(remote.identity_key, "identity")?;
    verify_signature(
        remote.identity_key,
        remote.signed_prekey,
        remote.signed_prekey_signature,
        "signed prekey",
    )?;
    verify_signature(remote.identity_key, remote.pq_prekey, remote.pq_prekey_signature, "pq prekey")?;

    let ephemeral = StaticSecret::from(ephemeral_seed);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

    let signed = contributory(
        ephemeral.diffie_hellman(&PublicKey::from(fixed_key(remote.signed_prekey, "signed prekey")?)),
    )?;
    let one_time = match remote.one_time_prekey {
        Some(prekey) => Some(contributory(
            ephemeral.diffie_hellman(&PublicKey::from(fixed_key(prekey, "one-time prekey")?)),
        )?),
        None => None,
    };

    let mut outputs = vec![signed.as_bytes()];
    outputs.extend(one_time.as_ref().map(SharedSecret::as_bytes));

    let local_identity = local.public_key();
    let secrets =
        derive_session_secrets(&outputs, &local_identity, &remote_identity, remote.pq_prekey);
    let ephemeral_signature = local.sign(&transcript(&ephemeral_public, &remote_identity));

    Ok(Initiation { secrets, ephemeral_public, ephemeral_signature })
}

/// Derive the initiator's session secrets on the consumer side.
///
/// # Errors
///
/// - `InvalidSignature`: the ephemeral key is not signed by
///   `initiator_identity`
/// - `InvalidKey` / `NonContributory`: malformed ephemeral key
pub fn respond(
    local: &ResponderKeys<'_>,
    initiator_identity: &[u8],
    ephemeral_public: &[u8],
    ephemeral_signature: &[u8],
) -> Result<SessionSecrets, CryptoError> {
    let initiator = fixed_key(initiator_identity, "identity")?;
    let ephemeral = PublicKey::from(fixed_key(ephemeral_public, "ephemeral")?);
    let local_identity = local.identity.public_key();

    verify_signature(
        initiator_identity,
        &transcript(ephemeral.as_bytes(), &local_identity),
        ephemeral_signature,
        "ephemeral key",
    )?;

    let signed = contributory(local.signed_prekey.secret.diffie_hellman(&ephemeral))?;
    let one_time = match local.one_time_prekey {
        Some(prekey) => Some(contributory(prekey.secret.diffie_hellman(&ephemeral))?),
        None => None,
    };

    let mut outputs = vec![signed.as_bytes()];
    outputs.extend(one_time.as_ref().map(SharedSecret::as_bytes));

    Ok(derive_session_secrets(&outputs, &initiator, &local_identity, local.pq_prekey))
}

fn transcript(ephemeral_public: &[u8; 32], responder_identity: &[u8; 32]) -> [u8; 64] {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(ephemeral_public);
    bytes[32..].copy_from_slice(responder_identity);
    bytes
}

fn fixed_key(bytes: &[u8], kind: &'static str) -> Result<[u8; PUBLIC_KEY_LEN], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKey {
        kind,
        reason: format!("expected {PUBLIC_KEY_LEN} bytes, got {}", bytes.len()),
    })
}

fn contributory(shared: SharedSecret) -> Result<SharedSecret, CryptoError> {
    if shared.was_contributory() { Ok(shared) } else { Err(CryptoError::NonContributory) }
}
