// ABOUTME: Store boundaries consumed by the sync engine
// ABOUTME: Source reads batches; destination answers bulk membership and applies transactional writes

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;

use super::error::StoreError;
use super::record::{Batch, ReferenceKey, Value};
use crate::utils::{quote_ident, validate_postgres_identifier};

/// Destination table name, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// Parse `table` or `schema.table`.
    pub fn parse(qualified: &str) -> Result<Self> {
        let parts: Vec<&str> = qualified.trim().split('.').collect();
        let (schema, name) = match parts.as_slice() {
            [name] => (None, *name),
            [schema, name] => (Some(*schema), *name),
            _ => bail!(
                "Invalid table name '{}': expected 'table' or 'schema.table'",
                qualified
            ),
        };

        if let Some(schema) = schema {
            validate_postgres_identifier(schema)?;
        }
        validate_postgres_identifier(name)?;

        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// SQL form with each part quoted.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Columns of the destination table and their SQL types, in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub table: TableName,
    pub columns: Vec<(String, String)>,
}

impl TableLayout {
    pub fn type_of(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, ty)| ty.as_str())
    }

    /// Columns from `required` that the table does not have.
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|c| self.type_of(c).is_none())
            .map(String::as_str)
            .collect()
    }
}

/// Rows to write, already projected onto `columns` (key column first).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl WriteSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<ReferenceKey> {
        self.rows
            .iter()
            .filter_map(|row| row.first().and_then(ReferenceKey::from_value))
            .collect()
    }
}

/// Outcome of a bulk membership lookup.
///
/// Keys are compared by their value in the destination column's type, not by
/// their source text: `007` and `7` are the same bigint, and an uppercase UUID
/// string names the same `uuid` as its lowercase form. Each requested key maps
/// to the destination's canonical text for it, and membership is recorded on
/// that canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLookup {
    identities: HashMap<ReferenceKey, ReferenceKey>,
    existing: HashSet<ReferenceKey>,
}

impl KeyLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the answer for one requested key.
    pub fn insert(&mut self, requested: ReferenceKey, canonical: ReferenceKey, exists: bool) {
        if exists {
            self.existing.insert(canonical.clone());
        }
        self.identities.insert(requested, canonical);
    }

    /// Canonical form of `key`; keys never looked up are their own identity.
    pub fn identity(&self, key: &ReferenceKey) -> ReferenceKey {
        self.identities.get(key).unwrap_or(key).clone()
    }

    /// Whether the destination already holds `key`.
    pub fn contains(&self, key: &ReferenceKey) -> bool {
        match self.identities.get(key) {
            Some(canonical) => self.existing.contains(canonical),
            None => self.existing.contains(key),
        }
    }

    /// Number of distinct destination rows matched.
    pub fn existing_count(&self) -> usize {
        self.existing.len()
    }
}

/// Read side of a cycle: `execute(query) -> (rows, column names)`.
pub trait SourceStore: Send {
    /// Run a read query and materialize every row.
    fn fetch(&mut self, query: &str) -> impl Future<Output = Result<Batch, StoreError>> + Send;

    /// Column names the query would produce, without running it.
    fn describe(
        &mut self,
        query: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Release the connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Write side of a cycle.
///
/// `update_rows` and `insert_rows` must each commit as a single unit: either
/// every row is written or none is visible.
pub trait DestinationStore: Send {
    /// Resolve the table's columns; `None` if the table does not exist.
    fn describe_table(
        &mut self,
        table: &TableName,
    ) -> impl Future<Output = Result<Option<TableLayout>, StoreError>> + Send;

    /// Resolve `keys` against `layout`'s key column in one round-trip: the
    /// canonical form of each key and whether it already exists.
    fn lookup_keys(
        &mut self,
        layout: &TableLayout,
        key_column: &str,
        keys: &[ReferenceKey],
    ) -> impl Future<Output = Result<KeyLookup, StoreError>> + Send;

    /// Whether `column` alone carries a unique index. Insert conflicts are only
    /// detectable when it does.
    fn key_is_unique(
        &mut self,
        layout: &TableLayout,
        column: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Update rows keyed on the first column. Returns rows affected.
    fn update_rows(
        &mut self,
        layout: &TableLayout,
        rows: &WriteSet,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Insert rows. A duplicate key must surface as [`StoreError::UniqueViolation`].
    fn insert_rows(
        &mut self,
        layout: &TableLayout,
        rows: &WriteSet,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Release the connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}
