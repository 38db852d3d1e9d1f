// ABOUTME: Column mapping between source records and the destination table
// ABOUTME: Fixes the written column order shared by updates and inserts

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::record::{Record, ReferenceKey, Value};
use crate::utils::validate_postgres_identifier;

/// Destination column that identifies an execution record.
pub const KEY_COLUMN: &str = "reference_id";

/// Destination columns managed by the replicator, in write order.
pub const DEFAULT_COLUMNS: [&str; 6] = [
    KEY_COLUMN,
    "label",
    "machine_id",
    "start_time",
    "end_time",
    "status",
];

/// One destination column and the source column it is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedColumn {
    pub destination: String,
    /// Source column name; defaults to the destination name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl MappedColumn {
    pub fn identity(name: &str) -> Self {
        Self {
            destination: name.to_string(),
            source: None,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.destination)
    }
}

/// Ordered column mapping. The key column is always written first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    columns: Vec<MappedColumn>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS.iter().map(|c| MappedColumn::identity(c)).collect(),
        }
    }
}

impl ColumnMapping {
    /// Build a mapping, moving the key column to the front.
    ///
    /// Fails if `reference_id` is missing or mapped twice, if a destination
    /// column appears twice, or if a name is not a plain identifier.
    pub fn new(columns: Vec<MappedColumn>) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            validate_postgres_identifier(&column.destination)?;
            if let Some(source) = &column.source {
                if source.trim().is_empty() {
                    bail!(
                        "Source column for '{}' cannot be empty",
                        column.destination
                    );
                }
            }
            if !seen.insert(column.destination.as_str()) {
                bail!("Destination column '{}' is mapped more than once", column.destination);
            }
        }

        let Some(key_index) = columns.iter().position(|c| c.destination == KEY_COLUMN) else {
            bail!("Column mapping must include the '{}' column", KEY_COLUMN);
        };

        let mut columns = columns;
        let key = columns.remove(key_index);
        columns.insert(0, key);

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[MappedColumn] {
        &self.columns
    }

    /// Destination column names in write order.
    pub fn destination_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.destination.clone()).collect()
    }

    /// Name of the source column that carries `reference_id`.
    pub fn key_source(&self) -> &str {
        self.columns[0].source_name()
    }

    /// The record's reference key, or `None` when the key column is absent or NULL.
    pub fn key_of(&self, record: &Record) -> Option<ReferenceKey> {
        record
            .get(self.key_source())
            .and_then(ReferenceKey::from_value)
    }

    /// Project a record onto the destination columns; unmapped source
    /// columns are ignored and missing ones become NULL.
    pub fn project(&self, record: &Record) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| record.get(c.source_name()).cloned().unwrap_or(Value::Null))
            .collect()
    }
}
