//! Payload encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{error::CryptoError, ratchet::MessageKey};

/// Size of the random suffix in the nonce (4 bytes)
pub const NONCE_RANDOM_SIZE: usize = 4;

/// An encrypted payload with the metadata needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// The ratchet generation of the message key
    pub generation: u32,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under a ratchet message key.
///
/// The nonce binds the payload to `channel_id` (session channel or broadcast
/// distribution id) and the key's generation. `aad` is authenticated but not
/// encrypted.
pub fn seal(
    plaintext: &[u8],
    message_key: &MessageKey,
    channel_id: &[u8; 16],
    aad: &[u8],
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> SealedPayload {
    let nonce = build_nonce(channel_id, message_key.generation(), random_suffix);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    SealedPayload { generation: message_key.generation(), nonce, ciphertext }
}

/// Decrypt a payload sealed by [`seal`].
///
/// # Errors
///
/// - `DecryptionFailed`: generation mismatch, wrong key, tampered ciphertext
///   or aad
pub fn open(
    sealed: &SealedPayload,
    message_key: &MessageKey,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if message_key.generation() != sealed.generation {
        return Err(CryptoError::DecryptionFailed {
            reason: format!(
                "generation mismatch: key is {}, message is {}",
                message_key.generation(),
                sealed.generation
            ),
        });
    }

    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    cipher
        .decrypt(XNonce::from_slice(&sealed.nonce), Payload { msg: &sealed.ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-15: channel id
/// - bytes 16-19: generation (big-endian)
/// - bytes 20-23: random suffix (caller-provided)
fn build_nonce(
    channel_id: &[u8; 16],
    generation: u32,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..16].copy_from_slice(channel_id);
    nonce[16..20].copy_from_slice(&generation.to_be_bytes());
    nonce[20..24].copy_from_slice(&random_suffix);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::SymmetricRatchet;

    const CHANNEL: [u8; 16] = [0x11; 16];

    fn key_at(generation: u32) -> MessageKey {
        SymmetricRatchet::new(&[7u8; 32]).advance_to(generation).unwrap()
    }

    #[test]
    fn sealed_payload_opens_with_same_key() {
        let key = key_at(3);
        let sealed = seal(b"hello consumer", &key, &CHANNEL, b"header", [0xAB; 4]);

        assert_eq!(sealed.generation, 3);
        assert_eq!(sealed.ciphertext.len(), b"hello consumer".len() + 16);
        assert_eq!(open(&sealed, &key, b"header").unwrap(), b"hello consumer");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = key_at(0);
        let sealed = seal(b"promo", &key, &CHANNEL, b"business-a", [0; 4]);

        let result = open(&sealed, &key, b"business-b");
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { reason }) if reason.contains("authentication")
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key_at(0);
        let mut sealed = seal(b"original message", &key, &CHANNEL, &[], [0; 4]);
        sealed.ciphertext[0] ^= 0xFF;

        assert!(open(&sealed, &key, &[]).is_err());
    }

    #[test]
    fn generation_mismatch_is_rejected_before_decrypting() {
        let sealed = seal(b"x", &key_at(1), &CHANNEL, &[], [0; 4]);

        assert!(matches!(
            open(&sealed, &key_at(2), &[]),
            Err(CryptoError::DecryptionFailed { reason }) if reason.contains("generation")
        ));
    }

    #[test]
    fn nonce_structure() {
        let nonce = build_nonce(&CHANNEL, 0x0D_0E_0F_10, [0xAB; 4]);

        assert_eq!(&nonce[0..16], &CHANNEL);
        assert_eq!(&nonce[16..20], &[0x0D, 0x0E, 0x0F, 0x10]);
        assert_eq!(&nonce[20..24], &[0xAB; 4]);
    }
}
