// ABOUTME: Error taxonomy for a sync cycle
// ABOUTME: Every variant aborts the current cycle only; the driver keeps polling

use std::fmt;
use thiserror::Error;

use super::record::ReferenceKey;

/// Failure reported by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The destination rejected a row because its unique key already exists.
    #[error("unique constraint violated: {detail}")]
    UniqueViolation { detail: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn backend(message: impl fmt::Display) -> Self {
        StoreError::Backend(anyhow::anyhow!("{}", message))
    }
}

/// Which side of the pipeline a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSide {
    Source,
    Destination,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSide::Source => f.write_str("source"),
            StoreSide::Destination => f.write_str("destination"),
        }
    }
}

/// Write operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Update,
    Insert,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOp::Update => f.write_str("update"),
            WriteOp::Insert => f.write_str("insert"),
        }
    }
}

/// Why a sync cycle was aborted.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to connect to {side} database")]
    Connect {
        side: StoreSide,
        #[source]
        source: StoreError,
    },

    /// The source query could not be run or its rows could not be read.
    #[error("failed to extract records from source")]
    Extraction(#[source] StoreError),

    /// The batch or the destination table does not satisfy the key/column contract.
    #[error("schema error: {0}")]
    Schema(String),

    /// The bulk membership check against the destination failed.
    #[error("failed to look up existing references in destination")]
    Lookup(#[source] StoreError),

    /// A write batch failed; nothing from that subset was committed.
    #[error("failed to {op} {rows} rows in destination")]
    Write {
        op: WriteOp,
        rows: usize,
        #[source]
        source: StoreError,
    },

    /// An insert hit the unique key on `reference_id`: another writer got there
    /// between the membership check and the insert. The whole insert subset of
    /// `attempted` rows was rolled back; `references` are the ones that collided.
    #[error(
        "insert of {attempted} rows conflicted on reference {}: {detail}",
        join_keys(.references)
    )]
    Conflict {
        detail: String,
        references: Vec<ReferenceKey>,
        attempted: usize,
    },
}

fn join_keys(keys: &[ReferenceKey]) -> String {
    keys.iter()
        .map(ReferenceKey::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl SyncError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }

    /// Short label used in logs and cycle statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Connect { .. } => "connect",
            SyncError::Extraction(_) => "extraction",
            SyncError::Schema(_) => "schema",
            SyncError::Lookup(_) => "lookup",
            SyncError::Write { .. } => "write",
            SyncError::Conflict { .. } => "conflict",
        }
    }
}
