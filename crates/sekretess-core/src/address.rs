//! Identities and addresses shared by the engine, the bridge and storage.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A (name, device id) pair identifying one end of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolAddress {
    name: String,
    device_id: u32,
}

impl ProtocolAddress {
    /// Create an address for `name` on `device_id`.
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self { name: name.into(), device_id }
    }

    /// Owner name (consumer or business).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device id.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

/// Serialized public identity key.
///
/// Compared by raw byte equality; this is a correctness check, not a secret
/// comparison.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(Vec<u8>);

impl IdentityKey {
    /// Wrap serialized public key bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serialized public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey(")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

/// The business identity: public key, serialized key pair and registration
/// id.
#[derive(Clone)]
pub struct LocalIdentity {
    identity_key: IdentityKey,
    key_pair: Vec<u8>,
    registration_id: u32,
}

impl LocalIdentity {
    /// Assemble an identity from engine output.
    pub fn new(identity_key: IdentityKey, key_pair: Vec<u8>, registration_id: u32) -> Self {
        Self { identity_key, key_pair, registration_id }
    }

    /// Public identity key.
    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    /// Opaque serialized key pair, as persisted in the identity store.
    pub fn key_pair(&self) -> &[u8] {
        &self.key_pair
    }

    /// Registration id.
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("identity_key", &self.identity_key)
            .field("registration_id", &self.registration_id)
            .finish_non_exhaustive()
    }
}

/// Correlation id shared by both halves of a broadcast session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistributionId(Uuid);

impl DistributionId {
    /// Build a random (version 4) id from caller-provided random bytes.
    pub fn from_random_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Raw bytes, used as the broadcast channel id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_distribution_id_is_version_4() {
        let id = DistributionId::from_random_bytes([0xAA; 16]);

        assert_eq!(id.0.get_version_num(), 4);
        assert_eq!(id, DistributionId::from_random_bytes([0xAA; 16]));
    }

    #[test]
    fn identity_key_debug_is_truncated() {
        let key = IdentityKey::new(vec![0xAB; 32]);

        assert_eq!(format!("{key:?}"), "IdentityKey(abababababababab…)");
    }

    #[test]
    fn local_identity_debug_hides_key_pair() {
        let identity = LocalIdentity::new(IdentityKey::new(vec![1]), vec![0x42; 32], 7);

        assert!(!format!("{identity:?}").contains("66"));
    }
}
