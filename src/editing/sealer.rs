//! One-way sealing of sensitive preset values before they are persisted.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use stepwright_common::CorrectionSet;

use crate::errors::EditingError;

const SEALED_PREFIX: &str = "v1:";

pub trait SecretSealer: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String, EditingError>;
}

/// ChaCha20-Poly1305 envelope: `v1:` followed by base64 of nonce and
/// ciphertext. A fresh random nonce is drawn per value, so sealing the same
/// plaintext twice yields different output.
pub struct ChaChaSealer {
    cipher: ChaCha20Poly1305,
}

impl ChaChaSealer {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(key: &str) -> anyhow::Result<Self> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| anyhow::anyhow!("sealing key is not valid base64: {}", e))?;
        let cipher = ChaCha20Poly1305::new_from_slice(&bytes).map_err(|_| {
            anyhow::anyhow!("sealing key must be 32 bytes, got {}", bytes.len())
        })?;
        Ok(Self { cipher })
    }
}

impl SecretSealer for ChaChaSealer {
    fn seal(&self, plaintext: &str) -> Result<String, EditingError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EditingError::Sealing("encryption failed".into()))?;
        let mut envelope = nonce.to_vec();
        envelope.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", SEALED_PREFIX, STANDARD.encode(envelope)))
    }
}

/// Used when no key is configured. Refuses everything.
pub struct DisabledSealer;

impl SecretSealer for DisabledSealer {
    fn seal(&self, _plaintext: &str) -> Result<String, EditingError> {
        Err(EditingError::Sealing(
            "no sealing key configured; set [sealing] key or STEPWRIGHT_SEAL_KEY".into(),
        ))
    }
}

/// Copy of `set` with every sensitive, non-empty preset value sealed.
pub fn seal_sensitive_values(
    sealer: &dyn SecretSealer,
    set: &CorrectionSet,
) -> Result<CorrectionSet, EditingError> {
    let mut sealed = set.clone();
    for step in &mut sealed.steps {
        for field in &mut step.fields {
            if field.needs_sealing()
                && let Some(value) = field.preset_value.as_deref()
            {
                field.preset_value = Some(sealer.seal(value)?);
            }
        }
    }
    Ok(sealed)
}
