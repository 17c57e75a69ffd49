//! Session key derivation using HKDF

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Label used for direct-session derivation
const SESSION_LABEL: &[u8] = b"sekretessSessionV1";

/// Domain-separation prefix prepended to the DH outputs
const DISCONTINUITY: [u8; 32] = [0xFF; 32];

/// Secrets shared by both ends of a freshly agreed direct session.
pub struct SessionSecrets {
    /// Generation-0 chain key for the business-to-consumer ratchet
    pub chain_seed: [u8; 32],
    /// Identifier bound into every payload nonce of the session
    pub channel_id: [u8; 16],
}

impl Drop for SessionSecrets {
    fn drop(&mut self) {
        self.chain_seed.zeroize();
    }
}

/// Derive session secrets from DH outputs and both identities.
///
/// The post-quantum prekey is bound into the transcript by hash. Swapping
/// initiator and responder identities yields different secrets.
pub fn derive_session_secrets(
    dh_outputs: &[&[u8; 32]],
    initiator_identity: &[u8; 32],
    responder_identity: &[u8; 32],
    pq_prekey: &[u8],
) -> SessionSecrets {
    let mut ikm = Vec::with_capacity(32 * (dh_outputs.len() + 1));
    ikm.extend_from_slice(&DISCONTINUITY);
    for output in dh_outputs {
        ikm.extend_from_slice(output.as_slice());
    }

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    ikm.zeroize();

    // label || initiator || responder || SHA-256(pq prekey)
    let mut info = Vec::with_capacity(SESSION_LABEL.len() + 96);
    info.extend_from_slice(SESSION_LABEL);
    info.extend_from_slice(initiator_identity);
    info.extend_from_slice(responder_identity);
    info.extend_from_slice(&Sha256::digest(pq_prekey));

    let mut okm = [0u8; 48];
    let Ok(()) = hkdf.expand(&info, &mut okm) else {
        unreachable!("48 bytes is a valid HKDF-SHA256 output length");
    };

    let mut secrets = SessionSecrets { chain_seed: [0u8; 32], channel_id: [0u8; 16] };
    secrets.chain_seed.copy_from_slice(&okm[..32]);
    secrets.channel_id.copy_from_slice(&okm[32..]);
    okm.zeroize();
    secrets
}
