// ABOUTME: ChangeWriter - applies reconciled subsets to the destination table
// ABOUTME: Updates present records and inserts absent ones, each subset in one transaction

use std::collections::HashMap;

use super::error::{StoreError, SyncError, WriteOp};
use super::mapping::{ColumnMapping, KEY_COLUMN};
use super::record::{Batch, ReferenceKey};
use super::store::{DestinationStore, KeyLookup, TableLayout, WriteSet};

/// Writes reconciled records to the destination.
///
/// Both operations project records through the same [`ColumnMapping`], so
/// the column order of an UPDATE always matches the one used for INSERT.
/// Each operation is all-or-nothing for its subset; an empty subset issues
/// no statement and no commit.
pub struct ChangeWriter<'a, D> {
    destination: &'a mut D,
    layout: &'a TableLayout,
    mapping: &'a ColumnMapping,
    identities: Option<&'a KeyLookup>,
}

impl<'a, D: DestinationStore> ChangeWriter<'a, D> {
    pub fn new(destination: &'a mut D, layout: &'a TableLayout, mapping: &'a ColumnMapping) -> Self {
        Self {
            destination,
            layout,
            mapping,
            identities: None,
        }
    }

    /// Treat keys the destination considers equal (`7` and `007`) as one
    /// reference when collapsing duplicates and reporting conflicts.
    pub fn with_identities(mut self, lookup: &'a KeyLookup) -> Self {
        self.identities = Some(lookup);
        self
    }

    fn identity(&self, key: &ReferenceKey) -> ReferenceKey {
        match self.identities {
            Some(lookup) => lookup.identity(key),
            None => key.clone(),
        }
    }

    /// Update every record of `present` in place, keyed on `reference_id`.
    ///
    /// # Returns
    ///
    /// The number of destination rows updated.
    pub async fn apply_updates(&mut self, present: &Batch) -> Result<u64, SyncError> {
        let rows = self.write_set(present)?;
        if rows.is_empty() {
            tracing::debug!("No existing records to update in {}", self.layout.table);
            return Ok(0);
        }

        let updated = self
            .destination
            .update_rows(self.layout, &rows)
            .await
            .map_err(|source| SyncError::Write {
                op: WriteOp::Update,
                rows: rows.len(),
                source,
            })?;

        tracing::info!("Updated {} records in {}", updated, self.layout.table);
        Ok(updated)
    }

    /// Insert every record of `absent`.
    ///
    /// A unique violation on `reference_id` means another writer inserted one
    /// of these references after the membership check; it is reported as
    /// [`SyncError::Conflict`] rather than a generic write failure.
    pub async fn apply_inserts(&mut self, absent: &Batch) -> Result<u64, SyncError> {
        let rows = self.write_set(absent)?;
        if rows.is_empty() {
            tracing::debug!("No new records to insert into {}", self.layout.table);
            return Ok(0);
        }

        let inserted = self
            .destination
            .insert_rows(self.layout, &rows)
            .await
            .map_err(|err| match err {
                StoreError::UniqueViolation { detail } => SyncError::Conflict {
                    references: self.conflicting_references(&detail, &rows),
                    attempted: rows.len(),
                    detail,
                },
                source => SyncError::Write {
                    op: WriteOp::Insert,
                    rows: rows.len(),
                    source,
                },
            })?;

        tracing::info!("Inserted {} records into {}", inserted, self.layout.table);
        Ok(inserted)
    }

    /// References from `rows` named by a unique-violation `detail`.
    ///
    /// Falls back to every key in `rows` when the detail names no key we sent.
    fn conflicting_references(&self, detail: &str, rows: &WriteSet) -> Vec<ReferenceKey> {
        let keys = rows.keys();
        let Some(conflict) = conflicting_key(detail) else {
            return keys;
        };
        let matched: Vec<ReferenceKey> = keys
            .iter()
            .filter(|k| **k == conflict || self.identity(k) == conflict)
            .cloned()
            .collect();
        if matched.is_empty() {
            keys
        } else {
            matched
        }
    }

    /// Project `batch` onto the mapped columns.
    ///
    /// A reference repeated inside the batch is written once, with the values
    /// of its last occurrence, at the position of its first occurrence. With
    /// identities attached, keys the destination considers equal count as
    /// the same reference.
    pub fn write_set(&self, batch: &Batch) -> Result<WriteSet, SyncError> {
        let mut positions: HashMap<ReferenceKey, usize> = HashMap::with_capacity(batch.len());
        let mut rows = Vec::with_capacity(batch.len());

        for (index, record) in batch.iter().enumerate() {
            let key = self.mapping.key_of(record).ok_or_else(|| {
                SyncError::Schema(format!(
                    "record {} has no value for key column '{}'",
                    index, KEY_COLUMN
                ))
            })?;
            let key = self.identity(&key);
            let row = self.mapping.project(record);
            match positions.get(&key) {
                Some(&position) => rows[position] = row,
                None => {
                    positions.insert(key, rows.len());
                    rows.push(row);
                }
            }
        }

        if rows.len() < batch.len() {
            tracing::debug!(
                "Collapsed {} duplicate references in batch",
                batch.len() - rows.len()
            );
        }

        Ok(WriteSet {
            columns: self.mapping.destination_columns(),
            rows,
        })
    }
}

/// Key value from a PostgreSQL unique-violation detail,
/// `Key (reference_id)=(7) already exists.`
fn conflicting_key(detail: &str) -> Option<ReferenceKey> {
    let start = detail.find(")=(")? + 3;
    let rest = &detail[start..];
    let end = rest.rfind(')')?;
    Some(ReferenceKey::new(&rest[..end]))
}
