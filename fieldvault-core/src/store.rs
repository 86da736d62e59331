//! External record store boundary
//!
//! The persistence engine holding the encrypted rows is an external
//! collaborator. This module exposes the minimal interface rotation needs
//! (scan in keyset order, update one row) plus an in-memory implementation
//! used by tests and the server's demo mode. Keeping the trait this small
//! keeps coupling minimal and the blast radius of storage changes small.

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Static configuration describing one table subject to rotation.
///
/// Supplied by the operator, never derived at runtime; defines the full
/// scope of what `rotate` touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRotationConfig {
    /// Table name in the record store
    pub table: String,

    /// Primary-key column used as the pagination cursor
    pub primary_key: String,

    /// Columns that may hold encrypted envelopes
    pub encrypted_columns: Vec<String>,
}

/// One row as seen by the rotation engine: primary key plus the requested
/// column values. `None` means the column is null/absent for this row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRow {
    pub id: String,
    pub columns: HashMap<String, Option<String>>,
}

/// Minimal record store interface for rotation.
pub trait RecordStore: Send + Sync {
    /// Scan one batch of rows ordered by primary key, strictly greater than
    /// `after`, at most `limit` rows.
    ///
    /// Keyset pagination keeps the scan correct under concurrent inserts:
    /// a strictly increasing cursor can neither skip nor duplicate rows the
    /// way numeric offsets can.
    fn scan_batch(
        &self,
        table: &str,
        primary_key: &str,
        columns: &[String],
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EncryptedRow>>;

    /// Write all changed columns of one row in a single update.
    fn update_row(
        &self,
        table: &str,
        primary_key: &str,
        id: &str,
        changes: &HashMap<String, String>,
    ) -> Result<()>;
}

type TableRows = BTreeMap<String, HashMap<String, Option<String>>>;

/// In-memory record store.
///
/// BTreeMap ordering gives the primary-key ordering the scan contract
/// requires. An optional backing file persists the tables as JSON after
/// each update (atomic temp-file + rename), which is enough for the demo
/// server; production deployments implement [`RecordStore`] over their own
/// engine.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<BTreeMap<String, TableRows>>,
    backing_file: Option<PathBuf>,
    update_calls: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON backing file (or start empty if it does not exist)
    /// and persist back to it after every update.
    pub fn with_backing_file(path: PathBuf) -> Result<Self> {
        let tables = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read record file: {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("failed to parse record file: {}", path.display()))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            backing_file: Some(path),
            update_calls: AtomicU64::new(0),
        })
    }

    /// Insert or replace a row. Test and seeding helper.
    pub fn insert_row<I>(&self, table: &str, id: &str, columns: I)
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), columns.into_iter().collect());
    }

    /// Read back a single column value.
    pub fn column_value(&self, table: &str, id: &str, column: &str) -> Option<String> {
        self.tables
            .read()
            .get(table)?
            .get(id)?
            .get(column)
            .cloned()
            .flatten()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |rows| rows.len())
    }

    /// Number of `update_row` calls issued so far. Lets tests assert that a
    /// re-run of rotation performs zero additional writes.
    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::Relaxed)
    }

    fn persist(&self, tables: &BTreeMap<String, TableRows>) -> Result<()> {
        let Some(path) = &self.backing_file else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(tables)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn scan_batch(
        &self,
        table: &str,
        _primary_key: &str,
        columns: &[String],
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EncryptedRow>> {
        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Err(anyhow!("unknown table: {}", table));
        };

        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.to_string()),
            None => Bound::Unbounded,
        };

        let batch = rows
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, stored)| EncryptedRow {
                id: id.clone(),
                columns: columns
                    .iter()
                    .map(|c| (c.clone(), stored.get(c).cloned().flatten()))
                    .collect(),
            })
            .collect();

        Ok(batch)
    }

    fn update_row(
        &self,
        table: &str,
        _primary_key: &str,
        id: &str,
        changes: &HashMap<String, String>,
    ) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);

        let mut tables = self.tables.write();
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| anyhow!("row not found: {}.{}", table, id))?;

        for (column, value) in changes {
            row.insert(column.clone(), Some(value.clone()));
        }

        self.persist(&tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> MemoryRecordStore {
        let store = MemoryRecordStore::new();
        for i in 1..=5 {
            store.insert_row(
                "orders",
                &format!("id-{:03}", i),
                [
                    ("phone".to_string(), Some(format!("phone-{}", i))),
                    ("document".to_string(), None),
                ],
            );
        }
        store
    }

    #[test]
    fn test_scan_batch_orders_by_primary_key() {
        let store = seeded_store();
        let columns = vec!["phone".to_string(), "document".to_string()];

        let batch = store.scan_batch("orders", "id", &columns, None, 3).unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["id-001", "id-002", "id-003"]);
        assert_eq!(
            batch[0].columns.get("phone"),
            Some(&Some("phone-1".to_string()))
        );
        assert_eq!(batch[0].columns.get("document"), Some(&None));
    }

    #[test]
    fn test_scan_batch_cursor_is_strictly_increasing() {
        let store = seeded_store();
        let columns = vec!["phone".to_string()];

        let first = store.scan_batch("orders", "id", &columns, None, 2).unwrap();
        let cursor = first.last().unwrap().id.clone();

        let second = store
            .scan_batch("orders", "id", &columns, Some(&cursor), 10)
            .unwrap();
        let ids: Vec<_> = second.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["id-003", "id-004", "id-005"]);
    }

    #[test]
    fn test_scan_unknown_table_errors() {
        let store = seeded_store();
        assert!(store
            .scan_batch("missing", "id", &["phone".to_string()], None, 10)
            .is_err());
    }

    #[test]
    fn test_update_row_writes_all_changes_and_counts() {
        let store = seeded_store();

        let changes: HashMap<String, String> = [
            ("phone".to_string(), "updated-phone".to_string()),
            ("document".to_string(), "updated-doc".to_string()),
        ]
        .into_iter()
        .collect();

        store.update_row("orders", "id", "id-002", &changes).unwrap();
        assert_eq!(
            store.column_value("orders", "id-002", "phone").as_deref(),
            Some("updated-phone")
        );
        assert_eq!(
            store.column_value("orders", "id-002", "document").as_deref(),
            Some("updated-doc")
        );
        assert_eq!(store.update_calls(), 1);
    }

    #[test]
    fn test_update_missing_row_errors() {
        let store = seeded_store();
        let changes: HashMap<String, String> =
            [("phone".to_string(), "x".to_string())].into_iter().collect();
        assert!(store.update_row("orders", "id", "id-999", &changes).is_err());
    }

    #[test]
    fn test_backing_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.json");

        {
            let store = MemoryRecordStore::with_backing_file(path.clone()).unwrap();
            store.insert_row(
                "orders",
                "id-001",
                [("phone".to_string(), Some("before".to_string()))],
            );
            let changes: HashMap<String, String> =
                [("phone".to_string(), "after".to_string())].into_iter().collect();
            store.update_row("orders", "id", "id-001", &changes).unwrap();
        }

        let reloaded = MemoryRecordStore::with_backing_file(path).unwrap();
        assert_eq!(
            reloaded.column_value("orders", "id-001", "phone").as_deref(),
            Some("after")
        );
    }
}
