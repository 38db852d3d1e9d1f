// ABOUTME: Reconciler - splits a batch into records already in the destination and new ones
// ABOUTME: Uses one bulk membership query per cycle keyed on reference_id

use std::collections::HashSet;

use super::error::SyncError;
use super::mapping::{ColumnMapping, KEY_COLUMN};
use super::record::{Batch, ReferenceKey};
use super::store::{DestinationStore, KeyLookup, TableLayout};

/// Partitions incoming records against the destination table.
///
/// Every record is classified exactly once: `present` if its reference id
/// already exists in the destination, `absent` otherwise. Keys match by their
/// value in the destination key column's type, so `007` finds row `7`. The
/// lookup is a single query, so round-trips stay constant regardless of batch
/// size.
pub struct Reconciler<'a> {
    mapping: &'a ColumnMapping,
}

impl<'a> Reconciler<'a> {
    pub fn new(mapping: &'a ColumnMapping) -> Self {
        Self { mapping }
    }

    /// Reference key of every record, in batch order.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Schema`] if any record lacks a non-null key; the
    /// whole batch is rejected.
    pub fn collect_keys(&self, batch: &Batch) -> Result<Vec<ReferenceKey>, SyncError> {
        batch
            .iter()
            .enumerate()
            .map(|(row, record)| {
                self.mapping.key_of(record).ok_or_else(|| {
                    SyncError::Schema(format!(
                        "record {} has no value for key column '{}' (mapped to {})",
                        row,
                        self.mapping.key_source(),
                        KEY_COLUMN
                    ))
                })
            })
            .collect()
    }

    /// Classify `batch` against the destination.
    ///
    /// # Arguments
    ///
    /// * `batch` - Records extracted in this cycle
    /// * `destination` - Destination store, used for one membership query
    /// * `layout` - Resolved destination table
    ///
    /// # Returns
    ///
    /// A [`ReconcileResult`] whose subsets are disjoint and together hold
    /// every record of `batch`, each in batch order.
    pub async fn reconcile<D: DestinationStore>(
        &self,
        batch: Batch,
        destination: &mut D,
        layout: &TableLayout,
    ) -> Result<ReconcileResult, SyncError> {
        let keys = self.collect_keys(&batch)?;

        if batch.is_empty() {
            tracing::debug!("Empty batch, skipping membership lookup");
            return Ok(ReconcileResult {
                present: batch.empty_like(),
                absent: batch,
                lookup: KeyLookup::new(),
            });
        }

        let mut seen = HashSet::with_capacity(keys.len());
        let unique: Vec<ReferenceKey> = keys
            .iter()
            .filter(|k| seen.insert(*k))
            .cloned()
            .collect();

        let lookup = destination
            .lookup_keys(layout, KEY_COLUMN, &unique)
            .await
            .map_err(SyncError::Lookup)?;

        let result = partition(batch, &keys, lookup);

        tracing::info!(
            "Reconciled {} records against {}: {} present, {} absent",
            result.len(),
            layout.table,
            result.present.len(),
            result.absent.len()
        );

        Ok(result)
    }
}

/// Split `batch` by membership of each record's key in `lookup`.
///
/// `keys[i]` must be the key of the i-th record.
pub fn partition(batch: Batch, keys: &[ReferenceKey], lookup: KeyLookup) -> ReconcileResult {
    let mut present = batch.empty_like();
    let mut absent = batch.empty_like();

    for (record, key) in batch.into_iter().zip(keys) {
        if lookup.contains(key) {
            present.push(record);
        } else {
            absent.push(record);
        }
    }

    ReconcileResult {
        present,
        absent,
        lookup,
    }
}

/// Outcome of reconciling one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    /// Records whose reference id already exists in the destination.
    pub present: Batch,
    /// Records not yet in the destination.
    pub absent: Batch,
    /// Destination identity of every key in the batch, for collapsing
    /// equivalent keys before writing.
    pub lookup: KeyLookup,
}

impl ReconcileResult {
    pub fn len(&self) -> usize {
        self.present.len() + self.absent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty() && self.absent.is_empty()
    }
}
