//! Symmetric ratchet shared by direct sessions and sender keys.
//!
//! Unlike a per-epoch ratchet, session ratchets are long-lived and must be
//! persisted between sends. [`SymmetricRatchet::from_parts`] and
//! [`SymmetricRatchet::chain_key`] exist for that purpose; callers are
//! responsible for keeping the persisted chain key confidential.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// Maximum number of generations a receiver skips to catch up.
pub const MAX_SKIP: u32 = 25_000;

/// A message key derived from the ratchet.
///
/// Used for a single encryption or decryption and zeroized on drop.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    generation: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Ratchet generation this key was derived from.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure symmetric ratchet.
///
/// Each [`advance()`](Self::advance) derives a message key from the current
/// chain key, derives the next chain key and overwrites the old one.
pub struct SymmetricRatchet {
    chain_key: [u8; 32],
    generation: u32,
}

impl SymmetricRatchet {
    /// Create a new ratchet whose generation-0 chain key is `seed`.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { chain_key: *seed, generation: 0 }
    }

    /// Resume a ratchet from a persisted chain key and generation.
    pub fn from_parts(chain_key: [u8; 32], generation: u32) -> Self {
        Self { chain_key, generation }
    }

    /// Current generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Current chain key, for persisting the ratchet.
    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// Advance the ratchet and return the key for the current generation.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.generation == u32::MAX {
            return Err(CryptoError::GenerationOverflow { current: self.generation });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current_gen = self.generation;
        self.generation += 1;

        Ok(MessageKey { key: message_key, generation: current_gen })
    }

    /// Advance the ratchet to `target` and return its message key.
    ///
    /// Skipped keys are discarded; a receiver cannot go backwards.
    pub fn advance_to(&mut self, target: u32) -> Result<MessageKey, CryptoError> {
        if target < self.generation || target - self.generation > MAX_SKIP {
            return Err(CryptoError::RatchetTooFarBehind {
                current: self.generation,
                requested: target,
            });
        }

        let mut message_key = self.advance()?;
        while message_key.generation() < target {
            message_key = self.advance()?;
        }
        Ok(message_key)
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for SymmetricRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed() -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        seed
    }

    #[test]
    fn advance_increments_generation() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());

        let key0 = ratchet.advance().unwrap();
        assert_eq!(key0.generation(), 0);
        assert_eq!(ratchet.generation(), 1);

        let key1 = ratchet.advance().unwrap();
        assert_eq!(key1.generation(), 1);
        assert_ne!(key0.key(), key1.key(), "keys must be unique");
    }

    #[test]
    fn ratchet_is_deterministic() {
        let mut ratchet1 = SymmetricRatchet::new(&test_seed());
        let mut ratchet2 = SymmetricRatchet::new(&test_seed());

        for _ in 0..10 {
            assert_eq!(ratchet1.advance().unwrap().key(), ratchet2.advance().unwrap().key());
        }
    }

    #[test]
    fn resumed_ratchet_continues_sequence() {
        let mut original = SymmetricRatchet::new(&test_seed());
        original.advance().unwrap();
        original.advance().unwrap();

        let mut resumed = SymmetricRatchet::from_parts(*original.chain_key(), original.generation());

        let expected = original.advance().unwrap();
        let actual = resumed.advance().unwrap();
        assert_eq!(actual.generation(), 2);
        assert_eq!(expected.key(), actual.key());
    }

    #[test]
    fn advance_to_matches_sequential_advance() {
        let mut sequential = SymmetricRatchet::new(&test_seed());
        for _ in 0..5 {
            sequential.advance().unwrap();
        }
        let key_sequential = sequential.advance().unwrap();

        let mut skipping = SymmetricRatchet::new(&test_seed());
        let key_skip = skipping.advance_to(5).unwrap();

        assert_eq!(key_skip.generation(), 5);
        assert_eq!(skipping.generation(), 6);
        assert_eq!(key_sequential.key(), key_skip.key());
    }

    #[test]
    fn advance_to_rejects_past_generation() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());
        ratchet.advance_to(5).unwrap();

        match ratchet.advance_to(3) {
            Err(CryptoError::RatchetTooFarBehind { current, requested }) => {
                assert_eq!(current, 6);
                assert_eq!(requested, 3);
            },
            _ => unreachable!("expected RatchetTooFarBehind error"),
        }
    }

    #[test]
    fn advance_to_rejects_too_far_ahead() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());

        let result = ratchet.advance_to(MAX_SKIP + 1);
        assert!(matches!(result, Err(CryptoError::RatchetTooFarBehind { .. })));
        assert_eq!(ratchet.generation(), 0, "rejected skip must not move the ratchet");
    }

    #[test]
    fn overflow_is_reported() {
        let mut ratchet = SymmetricRatchet::from_parts(test_seed(), u32::MAX);
        assert!(matches!(ratchet.advance(), Err(CryptoError::GenerationOverflow { .. })));
    }
}
