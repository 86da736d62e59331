//! Batch re-encryption engine
//!
//! Walks every configured table in keyset-paginated batches, re-encrypting
//! column values from older key versions to the rotation target. Runs as a
//! single sequential pass: one table at a time, one row at a time, to bound
//! memory and avoid write contention on the record store.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::job::RotationJob;
use super::state_store::RotationStateStore;
use crate::envelope::{classify, Classification};
use crate::field_crypto::FieldCrypto;
use crate::store::{EncryptedRow, RecordStore, TableRotationConfig};

/// Batch re-encryption over an external record store.
pub struct BatchRotator {
    crypto: FieldCrypto,
    records: Arc<dyn RecordStore>,
}

impl BatchRotator {
    pub fn new(crypto: FieldCrypto, records: Arc<dyn RecordStore>) -> Self {
        Self { crypto, records }
    }

    /// Re-encrypt all configured tables toward `target`, updating the job's
    /// counters as it goes.
    ///
    /// Per-row failures are counted and skipped; an error escaping a table
    /// scan itself aborts the whole job and propagates to the caller. Job
    /// progress is persisted after every batch and table so an operator can
    /// watch a long rotation move.
    pub async fn rotate_tables(
        &self,
        tables: &[TableRotationConfig],
        target: u32,
        batch_size: usize,
        batch_delay_ms: u64,
        job: &mut RotationJob,
        state: &dyn RotationStateStore,
    ) -> Result<()> {
        for table in tables {
            info!(
                "rotating table {} toward key version {} (batch size {})",
                table.table, target, batch_size
            );

            self.rotate_table(table, target, batch_size, batch_delay_ms, job, state)
                .await
                .with_context(|| format!("scan of table {} failed", table.table))?;

            state.save_job(job)?;
            info!(
                "table {} done: {} rows processed, {} failed so far",
                table.table, job.processed, job.failed
            );
        }

        Ok(())
    }

    async fn rotate_table(
        &self,
        table: &TableRotationConfig,
        target: u32,
        batch_size: usize,
        batch_delay_ms: u64,
        job: &mut RotationJob,
        state: &dyn RotationStateStore,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;

        loop {
            let batch = self.records.scan_batch(
                &table.table,
                &table.primary_key,
                &table.encrypted_columns,
                cursor.as_deref(),
                batch_size,
            )?;

            if batch.is_empty() {
                break;
            }

            for row in &batch {
                job.processed += 1;

                if let Err(e) = self.rotate_row(table, row, target) {
                    // One bad row must never block the rest of the scan
                    job.failed += 1;
                    warn!(
                        "row {}.{} failed to rotate: {:#}",
                        table.table, row.id, e
                    );
                }
            }

            cursor = batch.last().map(|row| row.id.clone());
            state.save_job(job)?;

            let full_batch = batch.len() == batch_size;
            if full_batch && batch_delay_ms > 0 {
                // Backpressure against the record store between batches
                sleep(Duration::from_millis(batch_delay_ms)).await;
            }
        }

        Ok(())
    }

    /// Rotate one row. Returns whether an update was written.
    ///
    /// Columns already at or above the target version are skipped, which is
    /// what makes a re-run after a partial failure safe: nothing is ever
    /// double-encrypted. All changed columns go out in a single update.
    fn rotate_row(
        &self,
        table: &TableRotationConfig,
        row: &EncryptedRow,
        target: u32,
    ) -> Result<bool> {
        let mut changes: HashMap<String, String> = HashMap::new();

        for column in &table.encrypted_columns {
            let Some(Some(value)) = row.columns.get(column) else {
                continue;
            };

            match classify(value) {
                Classification::Plaintext => continue,
                Classification::Encrypted { version } if version >= target => continue,
                Classification::Encrypted { .. } => {
                    let plaintext = self
                        .crypto
                        .decrypt(value)
                        .with_context(|| format!("column {} did not decrypt", column))?;
                    let renewed = self.crypto.encrypt_with_version(&plaintext, target)?;
                    changes.insert(column.clone(), renewed);
                }
                Classification::Ambiguous => {
                    // Probably a legacy version-1 ciphertext. When
                    // authentication fails the value is treated as plaintext
                    // and left alone; only certain envelopes count as
                    // failures.
                    match self.crypto.decrypt_tagged(value) {
                        Ok((plaintext, _)) => {
                            let renewed =
                                self.crypto.encrypt_with_version(&plaintext, target)?;
                            changes.insert(column.clone(), renewed);
                        }
                        Err(e) => {
                            debug!(
                                "ambiguous value in {}.{} left as plaintext: {:#}",
                                table.table, row.id, e
                            );
                        }
                    }
                }
            }
        }

        if changes.is_empty() {
            return Ok(false);
        }

        self.records
            .update_row(&table.table, &table.primary_key, &row.id, &changes)
            .with_context(|| "row update failed")?;
        Ok(true)
    }
}
