//! Ed25519 signing keys for identities and sender keys.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::error::CryptoError;

/// Length of a serialized public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a serialized signature.
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 key pair.
///
/// Serialized as its 32-byte secret seed; the secret is zeroized on drop.
pub struct SigningKeyPair {
    signing: SigningKey,
}

impl SigningKeyPair {
    /// Build a key pair from caller-provided random bytes.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }

    /// Restore a key pair from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: &[u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            kind: "private",
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
        Ok(Self::from_seed(seed))
    }

    /// Secret seed, for persisting the key pair.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Public half of the key pair.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify `signature` over `message` under `public_key`.
///
/// `kind` names what the signature covers and is carried in the error.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
    kind: &'static str,
) -> Result<(), CryptoError> {
    let key_bytes: &[u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| {
        CryptoError::InvalidKey {
            kind: "identity",
            reason: format!("expected {PUBLIC_KEY_LEN} bytes, got {}", public_key.len()),
        }
    })?;
    let verifying = VerifyingKey::from_bytes(key_bytes)
        .map_err(|e| CryptoError::InvalidKey { kind: "identity", reason: e.to_string() })?;
    let signature =
        Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature { kind })?;

    verifying.verify_strict(message, &signature).map_err(|_| CryptoError::InvalidSignature { kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_under_public_key() {
        let pair = SigningKeyPair::from_seed(&[5u8; 32]);
        let signature = pair.sign(b"prekey");

        verify_signature(&pair.public_key(), b"prekey", &signature, "prekey").unwrap();
    }

    #[test]
    fn signature_over_other_message_is_rejected() {
        let pair = SigningKeyPair::from_seed(&[5u8; 32]);
        let signature = pair.sign(b"prekey");

        let result = verify_signature(&pair.public_key(), b"other", &signature, "prekey");
        assert_eq!(result, Err(CryptoError::InvalidSignature { kind: "prekey" }));
    }

    #[test]
    fn truncated_public_key_is_rejected() {
        let pair = SigningKeyPair::from_seed(&[5u8; 32]);
        let signature = pair.sign(b"m");

        let result = verify_signature(&pair.public_key()[..31], b"m", &signature, "m");
        assert!(matches!(result, Err(CryptoError::InvalidKey { kind: "identity", .. })));
    }

    #[test]
    fn key_pair_restores_from_bytes() {
        let pair = SigningKeyPair::from_seed(&[8u8; 32]);
        let restored = SigningKeyPair::from_bytes(&pair.to_bytes()).unwrap();

        assert_eq!(pair.public_key(), restored.public_key());
        assert!(SigningKeyPair::from_bytes(&[0u8; 12]).is_err());
    }
}
