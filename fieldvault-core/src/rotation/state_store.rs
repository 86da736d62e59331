//! Persistence for rotation state
//!
//! Version records, job history, and the active-version pointer live
//! outside the process. The file store keeps them in a single JSON document
//! written atomically (temp file, then rename) so a crash can never leave a
//! half-written state file.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use super::job::{RotationJob, VersionRecord};

/// Storage interface for rotation state.
pub trait RotationStateStore: Send + Sync {
    /// Insert or replace a version record (keyed by version).
    fn save_version(&self, record: &VersionRecord) -> Result<()>;

    fn load_versions(&self) -> Result<Vec<VersionRecord>>;

    /// Insert or replace a job record (keyed by job id).
    fn save_job(&self, job: &RotationJob) -> Result<()>;

    /// All known jobs, oldest first.
    fn load_jobs(&self) -> Result<Vec<RotationJob>>;

    fn save_active_version(&self, version: u32) -> Result<()>;

    fn load_active_version(&self) -> Result<Option<u32>>;
}

/// The persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateSnapshot {
    #[serde(default)]
    versions: BTreeMap<u32, VersionRecord>,

    #[serde(default)]
    jobs: Vec<RotationJob>,

    #[serde(default)]
    active_version: Option<u32>,
}

impl StateSnapshot {
    fn upsert_job(&mut self, job: &RotationJob) {
        match self.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => self.jobs.push(job.clone()),
        }
    }
}

/// In-memory state store for tests and embedding.
#[derive(Default)]
pub struct MemoryStateStore {
    state: RwLock<StateSnapshot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one job by id. Test helper.
    pub fn job(&self, id: Uuid) -> Option<RotationJob> {
        self.state.read().jobs.iter().find(|j| j.id == id).cloned()
    }
}

impl RotationStateStore for MemoryStateStore {
    fn save_version(&self, record: &VersionRecord) -> Result<()> {
        self.state
            .write()
            .versions
            .insert(record.version, record.clone());
        Ok(())
    }

    fn load_versions(&self) -> Result<Vec<VersionRecord>> {
        Ok(self.state.read().versions.values().cloned().collect())
    }

    fn save_job(&self, job: &RotationJob) -> Result<()> {
        self.state.write().upsert_job(job);
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<RotationJob>> {
        Ok(self.state.read().jobs.clone())
    }

    fn save_active_version(&self, version: u32) -> Result<()> {
        self.state.write().active_version = Some(version);
        Ok(())
    }

    fn load_active_version(&self) -> Result<Option<u32>> {
        Ok(self.state.read().active_version)
    }
}

/// JSON file state store used by the server binary.
pub struct FileStateStore {
    path: PathBuf,
    state: RwLock<StateSnapshot>,
}

impl FileStateStore {
    /// Open a state file, creating an empty snapshot if it does not exist.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read state file: {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("failed to parse state file: {}", path.display()))?
        } else {
            debug!("no rotation state file at {}, starting empty", path.display());
            StateSnapshot::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, state: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(state)?;

        // Atomic write: temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl RotationStateStore for FileStateStore {
    fn save_version(&self, record: &VersionRecord) -> Result<()> {
        let mut state = self.state.write();
        state.versions.insert(record.version, record.clone());
        self.persist(&state)
    }

    fn load_versions(&self) -> Result<Vec<VersionRecord>> {
        Ok(self.state.read().versions.values().cloned().collect())
    }

    fn save_job(&self, job: &RotationJob) -> Result<()> {
        let mut state = self.state.write();
        state.upsert_job(job);
        self.persist(&state)
    }

    fn load_jobs(&self) -> Result<Vec<RotationJob>> {
        Ok(self.state.read().jobs.clone())
    }

    fn save_active_version(&self, version: u32) -> Result<()> {
        let mut state = self.state.write();
        state.active_version = Some(version);
        self.persist(&state)
    }

    fn load_active_version(&self) -> Result<Option<u32>> {
        Ok(self.state.read().active_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::job::VersionStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_record(version: u32) -> VersionRecord {
        VersionRecord {
            version,
            status: VersionStatus::Rotating,
            key_identifier: Some("vault".to_string()),
            prepared_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_store_upserts_versions() {
        let store = MemoryStateStore::new();
        store.save_version(&sample_record(2)).unwrap();

        let mut updated = sample_record(2);
        updated.status = VersionStatus::Active;
        store.save_version(&updated).unwrap();

        let versions = store.load_versions().unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].status, VersionStatus::Active);
    }

    #[test]
    fn test_memory_store_job_history() {
        let store = MemoryStateStore::new();

        let mut job = RotationJob::begin(1, 2);
        store.save_job(&job).unwrap();
        job.processed = 50;
        store.save_job(&job).unwrap();

        let second = RotationJob::begin(1, 2);
        store.save_job(&second).unwrap();

        let jobs = store.load_jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].processed, 50);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rotation_state.json");

        {
            let store = FileStateStore::open(path.clone()).unwrap();
            store.save_version(&sample_record(2)).unwrap();
            store.save_active_version(2).unwrap();

            let mut job = RotationJob::begin(1, 2);
            job.processed = 120;
            job.close_success();
            store.save_job(&job).unwrap();
        }

        let reopened = FileStateStore::open(path).unwrap();
        assert_eq!(reopened.load_active_version().unwrap(), Some(2));
        assert_eq!(reopened.load_versions().unwrap().len(), 1);

        let jobs = reopened.load_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].processed, 120);
        assert!(jobs[0].is_success());
    }

    #[test]
    fn test_file_store_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path().join("state.json")).unwrap();

        assert!(store.load_versions().unwrap().is_empty());
        assert!(store.load_jobs().unwrap().is_empty());
        assert_eq!(store.load_active_version().unwrap(), None);
    }
}
