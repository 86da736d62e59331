//! Key resolution and version management
//!
//! The provider resolves a key version to usable AES-256 key material and
//! decides which version is active for new encryptions. Secrets are supplied
//! externally, one per version; keys are derived, never generated here.

use anyhow::{anyhow, bail, Result};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Default base name for version secrets in the process environment.
pub const DEFAULT_SECRET_BASE_NAME: &str = "BUYER_ENCRYPTION_KEY";

/// Where version secrets come from.
///
/// The environment convention is: version 1 reads `<base_name>`, version N
/// (N >= 2) reads `<base_name>_V<N>`.
#[derive(Debug, Clone)]
pub enum SecretSource {
    /// Read secrets from process environment variables.
    Environment { base_name: String },

    /// Fixed in-memory secrets, keyed by version. Used by tests and
    /// embedding services that manage secret delivery themselves.
    Static(HashMap<u32, String>),
}

impl SecretSource {
    /// Environment source with the default base name.
    pub fn env() -> Self {
        Self::Environment {
            base_name: DEFAULT_SECRET_BASE_NAME.to_string(),
        }
    }

    /// Environment source with a custom base name.
    pub fn env_with_base(base_name: impl Into<String>) -> Self {
        Self::Environment {
            base_name: base_name.into(),
        }
    }

    /// Fixed secrets for tests and embedding.
    pub fn fixed<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self::Static(secrets.into_iter().map(|(v, s)| (v, s.into())).collect())
    }

    /// Environment variable name for a version under the naming convention.
    pub fn variable_name(base_name: &str, version: u32) -> String {
        if version == 1 {
            base_name.to_string()
        } else {
            format!("{}_V{}", base_name, version)
        }
    }

    fn secret(&self, version: u32) -> Option<String> {
        match self {
            Self::Environment { base_name } => {
                std::env::var(Self::variable_name(base_name, version))
                    .ok()
                    .filter(|s| !s.is_empty())
            }
            Self::Static(map) => map.get(&version).cloned(),
        }
    }
}

/// Resolves key versions to derived AES-256 keys.
///
/// Derived keys are cached for the lifetime of the provider; derivation is
/// deterministic for a given secret and key material is immutable per
/// version, so there is no invalidation path.
pub struct KeyProvider {
    source: SecretSource,
    derived: RwLock<HashMap<u32, [u8; 32]>>,
    pinned: RwLock<Option<u32>>,
}

impl KeyProvider {
    pub fn new(source: SecretSource) -> Self {
        Self {
            source,
            derived: RwLock::new(HashMap::new()),
            pinned: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &SecretSource {
        &self.source
    }

    /// Resolve a version to its derived 32-byte key.
    ///
    /// The derivation is exactly SHA-256 over the raw secret bytes. This is
    /// a storage compatibility contract: envelopes written years ago must
    /// stay decryptable, so the scheme cannot change.
    pub fn key(&self, version: u32) -> Result<[u8; 32]> {
        if version == 0 {
            bail!("key version 0 is not a valid version");
        }

        if let Some(key) = self.derived.read().get(&version) {
            return Ok(*key);
        }

        let secret = self
            .source
            .secret(version)
            .ok_or_else(|| anyhow!("no secret material configured for key version {}", version))?;

        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        self.derived.write().insert(version, key);
        Ok(key)
    }

    /// Whether secret material for a version is resolvable. Used to fail
    /// fast before starting a rotation rather than mid-batch.
    pub fn has_version(&self, version: u32) -> bool {
        if version == 0 {
            return false;
        }
        self.derived.read().contains_key(&version) || self.source.secret(version).is_some()
    }

    /// The version used for new encryptions.
    ///
    /// Returns the pinned version if an operator activated one, otherwise
    /// the highest version contiguous from 1 upward (probing 2, 3, ... and
    /// stopping at the first gap). A missing version-1 secret is a fatal
    /// configuration error.
    pub fn active_version(&self) -> Result<u32> {
        if let Some(version) = *self.pinned.read() {
            return Ok(version);
        }

        if !self.has_version(1) {
            bail!(
                "key version 1 secret is not configured; the legacy version must always be resolvable"
            );
        }

        let mut version = 1;
        while self.has_version(version + 1) {
            version += 1;
        }
        Ok(version)
    }

    /// Pin the active version explicitly. Called by `activate`.
    pub fn pin_active(&self, version: u32) {
        *self.pinned.write() = Some(version);
    }

    /// The explicitly pinned version, if any.
    pub fn pinned_version(&self) -> Option<u32> {
        *self.pinned.read()
    }
}
