//! Configuration for FieldVault
//!
//! This module provides:
//! - Secret naming configuration (one environment secret per key version)
//! - Rotation tuning knobs (batch size, inter-batch delay, failure gate)
//! - The static table rotation scope
//! - TOML loading with validation and defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::provider::DEFAULT_SECRET_BASE_NAME;
use crate::store::TableRotationConfig;

/// Secret naming convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Base environment variable name. Version 1 reads `<base_name>`,
    /// version N >= 2 reads `<base_name>_V<N>`.
    pub base_name: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            base_name: DEFAULT_SECRET_BASE_NAME.to_string(),
        }
    }
}

/// Rotation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Rows per scan batch when the request does not specify one
    pub default_batch_size: usize,

    /// Delay between batches in milliseconds (backpressure against the
    /// record store, not a correctness requirement)
    pub batch_delay_ms: u64,

    /// When set, a completed scan with more failed rows than this closes
    /// the job as an error instead of leaving the judgement entirely to the
    /// operator reading the counters
    pub failure_threshold: Option<u64>,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            batch_delay_ms: 100,
            failure_threshold: None,
        }
    }
}

/// Top-level FieldVault configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    pub secrets: SecretsConfig,
    pub rotation: RotationSettings,

    /// Tables in scope for rotation. Static configuration, never derived at
    /// runtime.
    pub tables: Vec<TableRotationConfig>,
}

impl KmsConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: KmsConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.secrets.base_name.trim().is_empty() {
            anyhow::bail!("secrets.base_name cannot be empty");
        }

        if self.rotation.default_batch_size == 0 {
            anyhow::bail!("rotation.default_batch_size cannot be 0");
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.table.trim().is_empty() {
                anyhow::bail!("table name cannot be empty");
            }
            if !seen.insert(table.table.as_str()) {
                anyhow::bail!("duplicate table in rotation scope: {}", table.table);
            }
            if table.primary_key.trim().is_empty() {
                anyhow::bail!("table {} is missing a primary key column", table.table);
            }
            if table.encrypted_columns.is_empty() {
                anyhow::bail!("table {} has no encrypted columns", table.table);
            }
        }

        Ok(())
    }
}
