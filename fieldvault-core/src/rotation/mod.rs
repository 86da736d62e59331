//! Key rotation orchestration
//!
//! This module provides:
//! - The operator request/response types for the four rotation actions
//! - The orchestrator driving prepare / rotate / activate / status
//! - Rotation job records and their persistence
//! - The batch re-encryption engine

pub mod job;
pub mod rotator;
pub mod state_store;

pub use job::*;
pub use rotator::*;
pub use state_store::*;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::audit::{AuditEvent, AuditLogger};
use crate::config::RotationSettings;
use crate::field_crypto::FieldCrypto;
use crate::provider::{KeyProvider, SecretSource};
use crate::store::{RecordStore, TableRotationConfig};

/// Operator request, dispatched by the `action` discriminator.
///
/// A closed enum with exhaustive matching: every action is handled or the
/// request fails to deserialize, there is no stringly-typed dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RotationRequest {
    Status,

    #[serde(rename_all = "camelCase")]
    Prepare {
        new_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_identifier: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Rotate {
        target_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<usize>,
    },

    Activate { version: u32 },
}

/// One known key version in a status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: u32,
    pub status: VersionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active_version: u32,
    pub available_versions: Vec<VersionInfo>,
    pub pending_rotations: Vec<RotationJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResponse {
    pub success: bool,
    pub version: u32,
    pub status: VersionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateResponse {
    pub success: bool,
    pub records_processed: u64,
    pub records_failed: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub success: bool,
    pub activated_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RotationResponse {
    Status(StatusResponse),
    Prepare(PrepareResponse),
    Rotate(RotateResponse),
    Activate(ActivateResponse),
}

/// Error surfaced at the request boundary.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Invalid request or operator configuration problem; fix and retry.
    #[error("{0}")]
    BadRequest(String),

    /// Storage or internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RequestError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Internal(_) => 500,
        }
    }
}

/// Drives the four rotation actions over the configured tables.
///
/// One sequential process per invocation: no internal workers, no
/// cross-invocation locking, no cancellation. Operators are responsible for
/// not running concurrent rotations against the same target version;
/// concurrent runs converge (rows at target are skipped) but may duplicate
/// work.
pub struct Orchestrator {
    provider: Arc<KeyProvider>,
    rotator: BatchRotator,
    state: Arc<dyn RotationStateStore>,
    tables: Vec<TableRotationConfig>,
    settings: RotationSettings,
    audit: AuditLogger,
}

impl Orchestrator {
    /// Wire the orchestrator, restoring a previously activated version into
    /// the provider's pin.
    pub fn new(
        provider: Arc<KeyProvider>,
        records: Arc<dyn RecordStore>,
        state: Arc<dyn RotationStateStore>,
        tables: Vec<TableRotationConfig>,
        settings: RotationSettings,
    ) -> Result<Self> {
        if let Some(version) = state.load_active_version()? {
            provider.pin_active(version);
        }

        let rotator = BatchRotator::new(FieldCrypto::new(provider.clone()), records);

        Ok(Self {
            provider,
            rotator,
            state,
            tables,
            settings,
            audit: AuditLogger::new(true),
        })
    }

    /// Audit trail of operator actions handled by this orchestrator.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Dispatch one operator request.
    pub async fn handle(&self, request: RotationRequest) -> Result<RotationResponse, RequestError> {
        match request {
            RotationRequest::Status => self.status().map(RotationResponse::Status),
            RotationRequest::Prepare {
                new_version,
                key_identifier,
            } => self
                .prepare(new_version, key_identifier)
                .map(RotationResponse::Prepare),
            RotationRequest::Rotate {
                target_version,
                batch_size,
            } => self
                .rotate(target_version, batch_size)
                .await
                .map(RotationResponse::Rotate),
            RotationRequest::Activate { version } => {
                self.activate(version).map(RotationResponse::Activate)
            }
        }
    }

    /// Pure read: active version, known versions with lifecycle status, and
    /// jobs without a terminal outcome. Causes no state change.
    fn status(&self) -> Result<StatusResponse, RequestError> {
        let active = self.provider.active_version()?;
        let stored: BTreeMap<u32, VersionRecord> = self
            .state
            .load_versions()?
            .into_iter()
            .map(|r| (r.version, r))
            .collect();

        let mut known: BTreeMap<u32, VersionInfo> = BTreeMap::new();

        // Every version whose secret is resolvable, contiguous from 1
        let mut version = 1;
        while self.provider.has_version(version) {
            known.insert(
                version,
                Self::version_info(version, active, stored.get(&version)),
            );
            version += 1;
        }

        // Registered versions beyond a gap still show up
        for (version, record) in &stored {
            known
                .entry(*version)
                .or_insert_with(|| Self::version_info(*version, active, Some(record)));
        }

        let pending_rotations = self
            .state
            .load_jobs()?
            .into_iter()
            .filter(|job| job.is_running())
            .collect();

        Ok(StatusResponse {
            active_version: active,
            available_versions: known.into_values().collect(),
            pending_rotations,
        })
    }

    /// Lifecycle inference relative to the active pointer. Stored records
    /// only decide the state of versions above the active one; anything at
    /// or below it is active/retired by definition.
    fn version_info(version: u32, active: u32, stored: Option<&VersionRecord>) -> VersionInfo {
        let status = if version == active {
            VersionStatus::Active
        } else if version < active {
            VersionStatus::Retired
        } else {
            stored.map(|r| r.status).unwrap_or(VersionStatus::Prepared)
        };

        VersionInfo {
            version,
            status,
            key_identifier: stored.and_then(|r| r.key_identifier.clone()),
        }
    }

    /// Register a new key version for rotation.
    ///
    /// The secret must already be provisioned: rejecting here prevents a
    /// rotation from starting with no way to ever decrypt its own output.
    fn prepare(
        &self,
        new_version: u32,
        key_identifier: Option<String>,
    ) -> Result<PrepareResponse, RequestError> {
        if new_version < 2 {
            return Err(RequestError::BadRequest(
                "newVersion must be 2 or higher; version 1 always pre-exists".to_string(),
            ));
        }

        if !self.provider.has_version(new_version) {
            return Err(RequestError::BadRequest(
                self.missing_secret_message(new_version),
            ));
        }

        let record = VersionRecord {
            version: new_version,
            status: VersionStatus::Rotating,
            key_identifier,
            prepared_at: Utc::now(),
        };
        self.state.save_version(&record)?;

        info!("key version {} prepared for rotation", new_version);
        self.audit.record(AuditEvent::VersionPrepared {
            version: new_version,
            key_identifier: record.key_identifier.clone(),
            timestamp: Utc::now(),
        });

        Ok(PrepareResponse {
            success: true,
            version: new_version,
            status: record.status,
        })
    }

    /// Re-encrypt all configured tables toward the target version as one
    /// job. Always reports both counters so the operator can judge whether
    /// `activate` is safe, even when the scan completed with failed rows.
    async fn rotate(
        &self,
        target_version: u32,
        batch_size: Option<usize>,
    ) -> Result<RotateResponse, RequestError> {
        if !self.provider.has_version(target_version) {
            return Err(RequestError::BadRequest(
                self.missing_secret_message(target_version),
            ));
        }

        let batch_size = batch_size.unwrap_or(self.settings.default_batch_size);
        if batch_size == 0 {
            return Err(RequestError::BadRequest(
                "batchSize must be greater than zero".to_string(),
            ));
        }

        let from_version = self.provider.active_version()?;
        let mut job = RotationJob::begin(from_version, target_version);
        self.state.save_job(&job)?;

        info!(
            "rotation job {} started: version {} -> {}",
            job.id, from_version, target_version
        );

        let run = self
            .rotator
            .rotate_tables(
                &self.tables,
                target_version,
                batch_size,
                self.settings.batch_delay_ms,
                &mut job,
                self.state.as_ref(),
            )
            .await;

        let response = match run {
            Ok(()) => {
                let over_threshold = self
                    .settings
                    .failure_threshold
                    .is_some_and(|limit| job.failed > limit);

                if over_threshold {
                    let message = format!(
                        "rotation to version {} finished with {} failed rows, over the configured threshold of {}",
                        target_version,
                        job.failed,
                        self.settings.failure_threshold.unwrap_or_default(),
                    );
                    job.close_error(message.clone());
                    RotateResponse {
                        success: false,
                        records_processed: job.processed,
                        records_failed: job.failed,
                        message,
                    }
                } else {
                    job.close_success();
                    RotateResponse {
                        success: true,
                        records_processed: job.processed,
                        records_failed: job.failed,
                        message: format!(
                            "rotation to version {} complete: {} rows processed, {} failed",
                            target_version, job.processed, job.failed
                        ),
                    }
                }
            }
            Err(e) => {
                // A failure escaping the scan itself aborts the job; per-row
                // problems never reach this branch
                let message = format!("rotation aborted: {:#}", e);
                job.close_error(message.clone());
                RotateResponse {
                    success: false,
                    records_processed: job.processed,
                    records_failed: job.failed,
                    message,
                }
            }
        };

        self.state.save_job(&job)?;
        info!(
            "rotation job {} closed: success={} processed={} failed={}",
            job.id, response.success, job.processed, job.failed
        );
        self.audit.record(AuditEvent::RotationCompleted {
            job_id: job.id,
            target_version,
            processed: job.processed,
            failed: job.failed,
            success: response.success,
            timestamp: Utc::now(),
        });

        Ok(response)
    }

    /// Flip the active-version pointer for new encryptions.
    ///
    /// Never touches existing ciphertext: envelopes embed their own version
    /// and stay decryptable regardless of the active pointer. That is the
    /// invariant that makes rotation zero-downtime.
    fn activate(&self, version: u32) -> Result<ActivateResponse, RequestError> {
        if !self.provider.has_version(version) {
            return Err(RequestError::BadRequest(format!(
                "version {} is not eligible for activation: {}",
                version,
                self.missing_secret_message(version)
            )));
        }

        let previous = self.provider.active_version().ok();

        self.state.save_active_version(version)?;
        self.provider.pin_active(version);

        let stored: BTreeMap<u32, VersionRecord> = self
            .state
            .load_versions()?
            .into_iter()
            .map(|r| (r.version, r))
            .collect();

        let mut activated = stored.get(&version).cloned().unwrap_or(VersionRecord {
            version,
            status: VersionStatus::Active,
            key_identifier: None,
            prepared_at: Utc::now(),
        });
        activated.status = VersionStatus::Active;
        self.state.save_version(&activated)?;

        if let Some(previous) = previous.filter(|p| *p != version) {
            if let Some(mut record) = stored.get(&previous).cloned() {
                record.status = VersionStatus::Retired;
                self.state.save_version(&record)?;
            }
        }

        info!("active key version is now {}", version);
        self.audit.record(AuditEvent::VersionActivated {
            version,
            previous,
            timestamp: Utc::now(),
        });

        Ok(ActivateResponse {
            success: true,
            activated_version: version,
        })
    }

    fn missing_secret_message(&self, version: u32) -> String {
        match self.provider.source() {
            SecretSource::Environment { base_name } => format!(
                "secret for key version {} is not provisioned (expected environment variable {})",
                version,
                SecretSource::variable_name(base_name, version)
            ),
            SecretSource::Static(_) => {
                format!("secret for key version {} is not provisioned", version)
            }
        }
    }
}
