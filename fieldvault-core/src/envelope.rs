//! Versioned ciphertext envelope format
//!
//! Envelopes are the durable on-disk representation of an encrypted field:
//! - Versioned: `ENC_V<version>:<base64 of IV || ciphertext>`
//! - Legacy:    bare base64 of the same byte layout, implicitly version 1
//!
//! The format is a storage contract: historical envelopes must stay
//! parseable byte-for-byte indefinitely.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

/// Prefix marking a versioned envelope.
pub const VERSION_PREFIX: &str = "ENC_V";

/// AES-GCM initialization vector length in bytes.
pub const IV_LEN: usize = 12;

/// Envelope parse errors
///
/// A malformed stored value indicates data corruption and is raised to the
/// caller rather than silently swallowed.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("versioned envelope is missing the ':' separator")]
    MissingSeparator,

    #[error("invalid envelope version: {0:?}")]
    InvalidVersion(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("payload too short to contain ciphertext: {0} bytes")]
    PayloadTooShort(usize),
}

/// A parsed envelope: key version plus the decoded `IV || ciphertext` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Key version embedded in the envelope (1 for legacy values)
    pub version: u32,

    /// Decoded payload: 12-byte IV followed by ciphertext and auth tag
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Parse a stored value into an envelope.
    ///
    /// Accepts both the versioned shape and bare base64 legacy values
    /// (implicit version 1).
    pub fn parse(value: &str) -> Result<Self, EnvelopeError> {
        if let Some(rest) = value.strip_prefix(VERSION_PREFIX) {
            let (version_str, payload_b64) = rest
                .split_once(':')
                .ok_or(EnvelopeError::MissingSeparator)?;

            let version: u32 = version_str
                .parse()
                .map_err(|_| EnvelopeError::InvalidVersion(version_str.to_string()))?;
            if version == 0 {
                return Err(EnvelopeError::InvalidVersion(version_str.to_string()));
            }

            let payload = BASE64.decode(payload_b64)?;
            if payload.len() <= IV_LEN {
                return Err(EnvelopeError::PayloadTooShort(payload.len()));
            }

            Ok(Self { version, payload })
        } else {
            let payload = BASE64.decode(value)?;
            if payload.len() <= IV_LEN {
                return Err(EnvelopeError::PayloadTooShort(payload.len()));
            }

            Ok(Self { version: 1, payload })
        }
    }

    /// Encode an envelope string for storage. Always versioned; the legacy
    /// shape is read-only compatibility.
    pub fn encode(version: u32, payload: &[u8]) -> String {
        format!("{}{}:{}", VERSION_PREFIX, version, BASE64.encode(payload))
    }

    /// The initialization vector portion of the payload.
    pub fn iv(&self) -> &[u8] {
        &self.payload[..IV_LEN]
    }

    /// The ciphertext (including auth tag) portion of the payload.
    pub fn ciphertext(&self) -> &[u8] {
        &self.payload[IV_LEN..]
    }
}

/// Best-effort classification of a stored value.
///
/// The versioned prefix is a certain match. Bare values are a heuristic:
/// anything that base64-decodes to more than 12 bytes could be a legacy
/// ciphertext, but a sufficiently long base64-looking plaintext is
/// indistinguishable from one without a schema-level flag, hence
/// `Ambiguous`. Callers attempt ambiguous values as legacy ciphertext and
/// fall back to treating them as plaintext when authentication fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Versioned prefix present. `version` is 0 when the tag itself is
    /// unreadable (corrupted envelope).
    Encrypted { version: u32 },

    /// Bare base64 decoding to more than 12 bytes; probably a legacy
    /// ciphertext, not provably so.
    Ambiguous,

    /// Cannot be a ciphertext.
    Plaintext,
}

/// Classify a stored value without attempting decryption.
pub fn classify(value: &str) -> Classification {
    if value.trim().is_empty() {
        return Classification::Plaintext;
    }

    if value.starts_with(VERSION_PREFIX) {
        let version = Envelope::parse(value).map(|e| e.version).unwrap_or(0);
        return Classification::Encrypted { version };
    }

    match BASE64.decode(value) {
        Ok(decoded) if decoded.len() > IV_LEN => Classification::Ambiguous,
        _ => Classification::Plaintext,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        // 12-byte IV plus 20 bytes of "ciphertext"
        let mut payload = vec![0u8; IV_LEN];
        payload.extend_from_slice(b"twenty.bytes.of.data");
        payload
    }

    #[test]
    fn test_versioned_roundtrip() {
        let payload = sample_payload();
        let encoded = Envelope::encode(3, &payload);
        assert!(encoded.starts_with("ENC_V3:"));

        let parsed = Envelope::parse(&encoded).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.iv().len(), IV_LEN);
        assert_eq!(parsed.ciphertext(), b"twenty.bytes.of.data");
    }

    #[test]
    fn test_legacy_parses_as_version_one() {
        let payload = sample_payload();
        let legacy = BASE64.encode(&payload);

        let parsed = Envelope::parse(&legacy).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_missing_separator_is_error() {
        let err = Envelope::parse("ENC_V2").unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingSeparator));
    }

    #[test]
    fn test_non_numeric_version_is_error() {
        let err = Envelope::parse("ENC_Vabc:AAAA").unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidVersion(_)));
    }

    #[test]
    fn test_version_zero_is_error() {
        let payload_b64 = BASE64.encode(sample_payload());
        let err = Envelope::parse(&format!("ENC_V0:{}", payload_b64)).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidVersion(_)));
    }

    #[test]
    fn test_bad_base64_is_error() {
        let err = Envelope::parse("ENC_V2:not-base64!!").unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidBase64(_)));
    }

    #[test]
    fn test_short_payload_is_error() {
        // Exactly one IV with no ciphertext cannot be a real envelope
        let iv_only = BASE64.encode([0u8; IV_LEN]);
        let err = Envelope::parse(&iv_only).unwrap_err();
        assert!(matches!(err, EnvelopeError::PayloadTooShort(12)));
    }

    #[test]
    fn test_classify_versioned() {
        let encoded = Envelope::encode(2, &sample_payload());
        assert_eq!(classify(&encoded), Classification::Encrypted { version: 2 });
    }

    #[test]
    fn test_classify_corrupted_versioned() {
        // Prefix is a certain match even when the rest is garbage
        assert_eq!(
            classify("ENC_V2:%%%"),
            Classification::Encrypted { version: 0 }
        );
        assert_eq!(classify("ENC_V2"), Classification::Encrypted { version: 0 });
    }

    #[test]
    fn test_classify_legacy_base64() {
        let legacy = BASE64.encode(sample_payload());
        assert_eq!(classify(&legacy), Classification::Ambiguous);
    }

    #[test]
    fn test_classify_plaintext() {
        assert_eq!(classify(""), Classification::Plaintext);
        assert_eq!(classify("   "), Classification::Plaintext);
        assert_eq!(classify("john@example.com"), Classification::Plaintext);
        // Valid base64 but too short to hold an IV and ciphertext
        assert_eq!(classify("AAAA"), Classification::Plaintext);
    }
}
