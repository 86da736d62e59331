//! Rotation job and key version lifecycle records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a key version as tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// Secret provisioned, not yet registered for rotation
    Prepared,

    /// Registered via `prepare`; batch rotation pending or in flight
    Rotating,

    /// Default version for new encryptions
    Active,

    /// Superseded; still needed to decrypt old envelopes
    Retired,
}

/// Registration metadata persisted by `prepare`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version: u32,
    pub status: VersionStatus,

    /// Optional operator-supplied annotation for the secret's origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_identifier: Option<String>,

    pub prepared_at: DateTime<Utc>,
}

/// Terminal outcome of a rotation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Error { message: String },
}

/// One `rotate` invocation.
///
/// Job history is append-only: a fresh `rotate` call always creates a fresh
/// job record; no old job row is ever resumed or mutated after it closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationJob {
    pub id: Uuid,

    /// Active version when the job started
    pub from_version: u32,

    /// Version the job re-encrypts toward
    pub target_version: u32,

    /// Rows examined so far; monotonically increasing
    pub processed: u64,

    /// Rows that failed to decrypt, re-encrypt, or update
    pub failed: u64,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
}

impl RotationJob {
    /// Open a fresh job record.
    pub fn begin(from_version: u32, target_version: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_version,
            target_version,
            processed: 0,
            failed: 0,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Some(JobOutcome::Success))
    }

    /// Close the job as completed.
    pub fn close_success(&mut self) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(JobOutcome::Success);
    }

    /// Close the job with an error message.
    pub fn close_error(&mut self, message: impl Into<String>) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(JobOutcome::Error {
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let mut job = RotationJob::begin(1, 2);
        assert!(job.is_running());
        assert!(!job.is_success());
        assert_eq!(job.processed, 0);

        job.processed += 10;
        job.failed += 1;
        job.close_success();

        assert!(!job.is_running());
        assert!(job.is_success());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_job_error_records_message() {
        let mut job = RotationJob::begin(1, 3);
        job.close_error("scan of table orders failed");

        match job.outcome {
            Some(JobOutcome::Error { ref message }) => {
                assert!(message.contains("orders"));
            }
            _ => panic!("expected error outcome"),
        }
    }

    #[test]
    fn test_fresh_jobs_get_fresh_ids() {
        let first = RotationJob::begin(1, 2);
        let second = RotationJob::begin(1, 2);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let mut job = RotationJob::begin(2, 3);
        job.processed = 120;
        job.close_success();

        let json = serde_json::to_string(&job).unwrap();
        let restored: RotationJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job, restored);
    }

    #[test]
    fn test_version_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&VersionStatus::Rotating).unwrap(),
            "\"rotating\""
        );
        assert_eq!(
            serde_json::to_string(&VersionStatus::Retired).unwrap(),
            "\"retired\""
        );
    }
}
