// ABOUTME: In-memory source and destination stores for unit tests
// ABOUTME: Destination writes are transactional and failures can be injected

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::driver::Connector;
use super::error::StoreError;
use super::mapping::{DEFAULT_COLUMNS, KEY_COLUMN};
use super::record::{Batch, Record, ReferenceKey, Value};
use super::store::{DestinationStore, KeyLookup, SourceStore, TableLayout, TableName, WriteSet};

/// Observable state behind a [`MemorySource`].
#[derive(Debug, Default)]
pub struct SourceState {
    pub batch: Batch,
    pub fail_fetch: bool,
    pub fetches: usize,
    pub closes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn with_records(records: Vec<Record>) -> Self {
        let source = Self::default();
        source.state().batch = Batch::from(records);
        source
    }

    pub fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap()
    }
}

impl SourceStore for MemorySource {
    async fn fetch(&mut self, _query: &str) -> Result<Batch, StoreError> {
        let mut state = self.state();
        state.fetches += 1;
        if state.fail_fetch {
            return Err(StoreError::backend("syntax error at or near \"SELEC\""));
        }
        Ok(state.batch.clone())
    }

    async fn describe(&mut self, _query: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state();
        if state.fail_fetch {
            return Err(StoreError::backend("syntax error at or near \"SELEC\""));
        }
        Ok(state.batch.columns().to_vec())
    }

    async fn close(self) {
        self.state().closes += 1;
    }
}

/// How an injected write failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// The statement fails before commit; the transaction rolls back.
    Backend,
}

/// The bigint/uuid identity of a key as the destination column would store it:
/// integers lose leading zeros, anything else is compared case-insensitively.
pub fn canonical_key(key: &ReferenceKey) -> ReferenceKey {
    match key.as_str().trim().parse::<i64>() {
        Ok(n) => ReferenceKey::new(n.to_string()),
        Err(_) => ReferenceKey::new(key.as_str().to_lowercase()),
    }
}

/// Observable state behind a [`MemoryDestination`].
///
/// Rows are keyed by [`canonical_key`], the way a typed key column compares
/// values.
#[derive(Debug)]
pub struct DestinationState {
    pub table: TableName,
    pub columns: Vec<(String, String)>,
    pub table_exists: bool,
    pub unique_key: bool,
    pub rows: BTreeMap<ReferenceKey, Record>,
    pub fail_lookup: bool,
    pub fail_update: Option<InjectedFailure>,
    pub fail_insert: Option<InjectedFailure>,
    /// Rows another writer slips in right before our next insert runs.
    pub concurrent_inserts: Vec<Record>,
    pub lookups: usize,
    pub lookup_sizes: Vec<usize>,
    pub statements: usize,
    pub commits: usize,
    pub closes: usize,
}

impl Default for DestinationState {
    fn default() -> Self {
        Self {
            table: TableName {
                schema: None,
                name: "execution_history".to_string(),
            },
            columns: DEFAULT_COLUMNS
                .iter()
                .map(|c| {
                    let ty = if *c == KEY_COLUMN { "bigint" } else { "text" };
                    (c.to_string(), ty.to_string())
                })
                .collect(),
            table_exists: true,
            unique_key: true,
            rows: BTreeMap::new(),
            fail_lookup: false,
            fail_update: None,
            fail_insert: None,
            concurrent_inserts: Vec::new(),
            lookups: 0,
            lookup_sizes: Vec::new(),
            statements: 0,
            commits: 0,
            closes: 0,
        }
    }
}

impl DestinationState {
    fn store_row(&mut self, record: Record) {
        let key = record
            .get(KEY_COLUMN)
            .and_then(ReferenceKey::from_value)
            .expect("destination rows always carry reference_id");
        self.rows.insert(canonical_key(&key), record);
    }

    /// Column value of the row stored under `key`.
    pub fn value(&self, key: &str, column: &str) -> Option<Value> {
        self.rows
            .get(&canonical_key(&ReferenceKey::new(key)))
            .and_then(|row| row.get(column).cloned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<DestinationState>>,
}

impl MemoryDestination {
    pub fn with_rows(rows: Vec<Record>) -> Self {
        let destination = Self::default();
        {
            let mut state = destination.state();
            for row in rows {
                state.store_row(row);
            }
        }
        destination
    }

    pub fn state(&self) -> MutexGuard<'_, DestinationState> {
        self.state.lock().unwrap()
    }
}

fn row_record(columns: &[String], row: &[Value]) -> Record {
    Record::from_pairs(columns.iter().cloned().zip(row.iter().cloned()))
}

impl DestinationStore for MemoryDestination {
    async fn describe_table(&mut self, table: &TableName) -> Result<Option<TableLayout>, StoreError> {
        let state = self.state();
        if !state.table_exists || state.table != *table {
            return Ok(None);
        }
        Ok(Some(TableLayout {
            table: table.clone(),
            columns: state.columns.clone(),
        }))
    }

    async fn lookup_keys(
        &mut self,
        _layout: &TableLayout,
        _key_column: &str,
        keys: &[ReferenceKey],
    ) -> Result<KeyLookup, StoreError> {
        let mut state = self.state();
        state.lookups += 1;
        state.lookup_sizes.push(keys.len());
        if state.fail_lookup {
            return Err(StoreError::backend("connection to server was lost"));
        }
        let mut lookup = KeyLookup::new();
        for key in keys {
            let canonical = canonical_key(key);
            let exists = state.rows.contains_key(&canonical);
            lookup.insert(key.clone(), canonical, exists);
        }
        Ok(lookup)
    }

    async fn key_is_unique(&mut self, _layout: &TableLayout, column: &str) -> Result<bool, StoreError> {
        Ok(column == KEY_COLUMN && self.state().unique_key)
    }

    async fn update_rows(&mut self, _layout: &TableLayout, rows: &WriteSet) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.statements += 1;
        if state.fail_update.is_some() {
            return Err(StoreError::backend("could not serialize access"));
        }

        let mut affected = 0;
        for row in &rows.rows {
            let Some(key) = row.first().and_then(ReferenceKey::from_value) else {
                continue;
            };
            if let Some(existing) = state.rows.get_mut(&canonical_key(&key)) {
                for (column, value) in rows.columns.iter().zip(row) {
                    existing.set(column.clone(), value.clone());
                }
                affected += 1;
            }
        }
        state.commits += 1;
        Ok(affected)
    }

    async fn insert_rows(&mut self, _layout: &TableLayout, rows: &WriteSet) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.statements += 1;

        for record in std::mem::take(&mut state.concurrent_inserts) {
            state.store_row(record);
        }

        if state.fail_insert.is_some() {
            return Err(StoreError::backend("server closed the connection unexpectedly"));
        }

        let mut staged = HashSet::new();
        for key in rows.keys() {
            let key = canonical_key(&key);
            if state.rows.contains_key(&key) || !staged.insert(key.clone()) {
                return Err(StoreError::UniqueViolation {
                    detail: format!("Key (reference_id)=({}) already exists.", key),
                });
            }
        }

        for row in &rows.rows {
            state.store_row(row_record(&rows.columns, row));
        }
        state.commits += 1;
        Ok(rows.len() as u64)
    }

    async fn close(self) {
        self.state().closes += 1;
    }
}

/// Hands out clones of shared in-memory stores, one pair per cycle.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    pub source: MemorySource,
    pub destination: MemoryDestination,
    pub fail_destination_connect: bool,
}

impl Connector for MemoryConnector {
    type Source = MemorySource;
    type Destination = MemoryDestination;

    async fn open_source(&self) -> anyhow::Result<MemorySource> {
        Ok(self.source.clone())
    }

    async fn open_destination(&self) -> anyhow::Result<MemoryDestination> {
        if self.fail_destination_connect {
            anyhow::bail!("could not connect to server: Connection refused");
        }
        Ok(self.destination.clone())
    }
}

/// Shorthand for an execution record with a reference id and status.
pub fn execution(reference_id: i64, status: &str) -> Record {
    Record::from_pairs([
        (KEY_COLUMN, Value::Int(reference_id)),
        ("status", Value::from(status)),
    ])
}
