// ABOUTME: Batch-pull sync engine for execution records
// ABOUTME: Extract from source, reconcile by reference_id, update or insert into destination

pub mod driver;
pub mod error;
pub mod extractor;
pub mod mapping;
pub mod reconciler;
pub mod record;
pub mod store;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{
    resolve_layout, sync_once, Connector, CycleDriver, CycleStats, DriverCounters, DriverState,
    SyncPlan,
};
pub use error::{StoreError, StoreSide, SyncError, WriteOp};
pub use extractor::Extractor;
pub use mapping::{ColumnMapping, MappedColumn, DEFAULT_COLUMNS, KEY_COLUMN};
pub use reconciler::{partition, ReconcileResult, Reconciler};
pub use record::{Batch, Record, ReferenceKey, Value};
pub use store::{DestinationStore, KeyLookup, SourceStore, TableLayout, TableName, WriteSet};
pub use writer::ChangeWriter;
