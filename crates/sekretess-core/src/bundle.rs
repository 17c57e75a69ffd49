//! Consumer key bundles.
//!
//! A bundle lives for a single session-establishment call and is never
//! persisted.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};

use crate::{address::IdentityKey, channel::ConsumerKeysResponse, error::PrekeyBundleError};

/// An unsigned prekey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKey {
    /// Prekey id
    pub id: u32,
    /// Serialized public key
    pub public_key: Vec<u8>,
}

/// A prekey signed by the consumer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKey {
    /// Prekey id
    pub id: u32,
    /// Serialized public key
    pub public_key: Vec<u8>,
    /// Identity signature over `public_key`
    pub signature: Vec<u8>,
}

/// Public key material needed to open a session with one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerKeyBundle {
    /// Consumer name the server returned the bundle for
    pub consumer: String,
    /// Consumer registration id
    pub registration_id: u32,
    /// Consumer identity key
    pub identity_key: IdentityKey,
    /// One-time prekey
    pub one_time_prekey: PreKey,
    /// Signed prekey
    pub signed_prekey: SignedPreKey,
    /// Post-quantum signed prekey
    pub pq_prekey: SignedPreKey,
}

impl TryFrom<&ConsumerKeysResponse> for ConsumerKeyBundle {
    type Error = PrekeyBundleError;

    fn try_from(response: &ConsumerKeysResponse) -> Result<Self, Self::Error> {
        let (opk_id, opk) = response.opk.split_once(':').ok_or_else(|| {
            PrekeyBundleError::malformed("opk", "expected \"<id>:<base64>\"")
        })?;

        Ok(Self {
            consumer: response.username.clone(),
            registration_id: response.reg_id,
            identity_key: IdentityKey::new(decode("ik", &response.ik)?),
            one_time_prekey: PreKey { id: parse_id("opk", opk_id)?, public_key: decode("opk", opk)? },
            signed_prekey: SignedPreKey {
                id: parse_id("spkID", &response.spk_id)?,
                public_key: decode("spk", &response.spk)?,
                signature: decode("spkSignature", &response.spk_signature)?,
            },
            pq_prekey: SignedPreKey {
                id: parse_id("pqSpkID", &response.pq_spk_id)?,
                public_key: decode("pqSpk", &response.pq_spk)?,
                signature: decode("pqSpkSignature", &response.pq_spk_signature)?,
            },
        })
    }
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, PrekeyBundleError> {
    let bytes = B64.decode(value).map_err(|e| PrekeyBundleError::malformed(field, e))?;
    if bytes.is_empty() {
        return Err(PrekeyBundleError::malformed(field, "empty value"));
    }
    Ok(bytes)
}

fn parse_id(field: &'static str, value: &str) -> Result<u32, PrekeyBundleError> {
    value.trim().parse().map_err(|e| PrekeyBundleError::malformed(field, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> ConsumerKeysResponse {
        ConsumerKeysResponse {
            username: "alice".to_string(),
            ik: B64.encode([1u8; 32]),
            opk: format!("17:{}", B64.encode([2u8; 32])),
            reg_id: 4242,
            spk: B64.encode([3u8; 32]),
            spk_id: "5".to_string(),
            spk_signature: B64.encode([4u8; 64]),
            pq_spk: B64.encode([5u8; 96]),
            pq_spk_id: "6".to_string(),
            pq_spk_signature: B64.encode([6u8; 64]),
        }
    }

    #[test]
    fn parses_well_formed_response() {
        let bundle = ConsumerKeyBundle::try_from(&response()).unwrap();

        assert_eq!(bundle.consumer, "alice");
        assert_eq!(bundle.registration_id, 4242);
        assert_eq!(bundle.identity_key.as_bytes(), &[1u8; 32]);
        assert_eq!(bundle.one_time_prekey.id, 17);
        assert_eq!(bundle.signed_prekey.id, 5);
        assert_eq!(bundle.pq_prekey.public_key.len(), 96);
    }

    #[test]
    fn opk_without_id_is_malformed() {
        let mut response = response();
        response.opk = B64.encode([2u8; 32]);

        assert!(matches!(
            ConsumerKeyBundle::try_from(&response),
            Err(PrekeyBundleError::Malformed { field: "opk", .. })
        ));
    }

    #[test]
    fn non_numeric_prekey_id_is_malformed() {
        let mut response = response();
        response.pq_spk_id = "six".to_string();

        assert!(matches!(
            ConsumerKeyBundle::try_from(&response),
            Err(PrekeyBundleError::Malformed { field: "pqSpkID", .. })
        ));
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let mut response = response();
        response.ik = "not base64!".to_string();

        assert!(matches!(
            ConsumerKeyBundle::try_from(&response),
            Err(PrekeyBundleError::Malformed { field: "ik", .. })
        ));
    }
}
