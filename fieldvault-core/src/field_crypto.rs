//! Field encryption and decryption using AES-256-GCM
//!
//! Turns sensitive plaintext strings into versioned envelopes and back.
//! Decryption is always version-aware: the envelope says which key to use,
//! independent of which version is currently active for new writes.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::warn;

use crate::envelope::{classify, Classification, Envelope, IV_LEN};
use crate::provider::KeyProvider;

/// Result of a tolerant decryption.
///
/// `version` is the key version the value was decrypted under; 0 means the
/// value was returned as-is, either because it was never encrypted or
/// because it looked encrypted but could not be decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedField {
    pub value: String,
    pub version: u32,
}

/// Encrypts and decrypts individual field values.
pub struct FieldCrypto {
    provider: Arc<KeyProvider>,
}

impl FieldCrypto {
    pub fn new(provider: Arc<KeyProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<KeyProvider> {
        &self.provider
    }

    /// Encrypt a plaintext under the active key version.
    ///
    /// Empty or blank plaintext maps to `None` so optional sensitive fields
    /// need no separate null handling at call sites.
    pub fn encrypt(&self, plaintext: &str) -> Result<Option<String>> {
        if plaintext.trim().is_empty() {
            return Ok(None);
        }

        let version = self.provider.active_version()?;
        Ok(Some(self.encrypt_with_version(plaintext, version)?))
    }

    /// Encrypt under an explicit key version, bypassing active-version
    /// resolution. Used by the rotation engine to target the new version
    /// before the active pointer flips.
    pub fn encrypt_with_version(&self, plaintext: &str, version: u32) -> Result<String> {
        let key_bytes = self.provider.key(version)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        // Fresh random IV per call. Nonce reuse under GCM destroys
        // confidentiality, so the IV is never derived or reused.
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("encryption failed under key version {}: {}", version, e))?;

        let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        Ok(Envelope::encode(version, &payload))
    }

    /// Decrypt an envelope (versioned or legacy) back to plaintext.
    ///
    /// Parse errors and authentication failures are raised to the caller.
    pub fn decrypt(&self, value: &str) -> Result<String> {
        self.decrypt_tagged(value).map(|(plaintext, _)| plaintext)
    }

    /// Decrypt and report the key version the value was encrypted under.
    pub fn decrypt_tagged(&self, value: &str) -> Result<(String, u32)> {
        let envelope = Envelope::parse(value)?;
        let plaintext = self.open(&envelope)?;
        Ok((plaintext, envelope.version))
    }

    /// Tolerant decryption for mixed plaintext/ciphertext columns.
    ///
    /// Values that do not look encrypted are returned unchanged. Values
    /// that look encrypted but fail to decrypt fall back to the original
    /// string rather than raising, tagged with version 0.
    pub fn decrypt_safe(&self, value: &str) -> DecryptedField {
        match classify(value) {
            Classification::Plaintext => DecryptedField {
                value: value.to_string(),
                version: 0,
            },
            Classification::Encrypted { .. } | Classification::Ambiguous => {
                match self.decrypt_tagged(value) {
                    Ok((plaintext, version)) => DecryptedField {
                        value: plaintext,
                        version,
                    },
                    Err(e) => {
                        warn!("value looked encrypted but did not decrypt: {:#}", e);
                        DecryptedField {
                            value: value.to_string(),
                            version: 0,
                        }
                    }
                }
            }
        }
    }

    /// The key version embedded in an envelope.
    pub fn encrypted_version(&self, value: &str) -> Result<u32> {
        Ok(Envelope::parse(value)?.version)
    }

    fn open(&self, envelope: &Envelope) -> Result<String> {
        let key_bytes = self.provider.key(envelope.version)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(envelope.iv());

        let plaintext = cipher
            .decrypt(nonce, envelope.ciphertext())
            .map_err(|e| {
                anyhow!(
                    "decryption failed under key version {}: {}",
                    envelope.version,
                    e
                )
            })?;

        String::from_utf8(plaintext).context("decrypted payload is not valid UTF-8")
    }
}
