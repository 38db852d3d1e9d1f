// ABOUTME: PostgreSQL implementations of the source and destination stores
// ABOUTME: Bulk membership via UNNEST of keys, bulk writes via UNNEST of text arrays inside one transaction

use anyhow::Context;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::Row;

use super::connection::{connect_with_retry, PgSession};
use crate::sync::{
    Batch, Connector, DestinationStore, KeyLookup, Record, ReferenceKey, SourceStore, StoreError,
    TableLayout, TableName, Value, WriteSet,
};
use crate::utils::quote_ident;

/// Opens PostgreSQL sessions for the source and destination of each cycle.
#[derive(Debug, Clone)]
pub struct PgConnector {
    source_url: String,
    destination_url: String,
}

impl PgConnector {
    pub fn new(source_url: impl Into<String>, destination_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            destination_url: destination_url.into(),
        }
    }
}

impl Connector for PgConnector {
    type Source = PgSource;
    type Destination = PgDestination;

    async fn open_source(&self) -> anyhow::Result<PgSource> {
        let session = connect_with_retry(&self.source_url)
            .await
            .context("Failed to connect to source database")?;
        Ok(PgSource { session })
    }

    async fn open_destination(&self) -> anyhow::Result<PgDestination> {
        let session = connect_with_retry(&self.destination_url)
            .await
            .context("Failed to connect to destination database")?;
        Ok(PgDestination { session })
    }
}

fn backend(err: tokio_postgres::Error, what: impl Into<String>) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err).context(what.into()))
}

/// Reads execution records with an arbitrary read-only query.
pub struct PgSource {
    session: PgSession,
}

impl PgSource {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }
}

impl SourceStore for PgSource {
    async fn fetch(&mut self, query: &str) -> Result<Batch, StoreError> {
        let client = self.session.client();
        let statement = client
            .prepare(query)
            .await
            .map_err(|e| backend(e, "Failed to prepare source query"))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = client
            .query(&statement, &[])
            .await
            .map_err(|e| backend(e, "Failed to run source query"))?;

        let mut batch = Batch::new(columns, Vec::with_capacity(rows.len()));
        for row in &rows {
            batch.push(row_to_record(row)?);
        }
        Ok(batch)
    }

    async fn describe(&mut self, query: &str) -> Result<Vec<String>, StoreError> {
        let statement = self
            .session
            .client()
            .prepare(query)
            .await
            .map_err(|e| backend(e, "Failed to prepare source query"))?;
        Ok(statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect())
    }

    async fn close(self) {
        self.session.close().await;
    }
}

/// Convert a row into a [`Record`], keeping column order.
pub fn row_to_record(row: &Row) -> Result<Record, StoreError> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = decode_value(row, idx, ty).map_err(|e| {
            StoreError::Backend(anyhow::Error::new(e).context(format!(
                "Failed to decode column '{}' ({})",
                column.name(),
                ty
            )))
        })?;
        let Some(value) = value else {
            return Err(StoreError::backend(format!(
                "Column '{name}' has type {ty} which cannot be read; \
                 cast it in the source query, e.g. {name}::text",
                name = column.name(),
                ty = ty
            )));
        };
        record.set(column.name(), value);
    }
    Ok(record)
}

/// Text, varchar, bpchar, name, citext, enums, and domains over any of them.
///
/// All share the text wire format, so the raw bytes are the value.
struct TextLike(String);

impl<'a> FromSql<'a> for TextLike {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(TextLike(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        match ty.kind() {
            Kind::Enum(_) => true,
            Kind::Domain(base) => Self::accepts(base),
            _ => <String as FromSql>::accepts(ty),
        }
    }
}

/// `None` when `ty` has no decoding.
fn decode_value(row: &Row, idx: usize, ty: &Type) -> Result<Option<Value>, tokio_postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(v as i64)),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(v as i64)),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| Value::Int(v as i64)),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v as f64)),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(Value::Numeric),
        Type::UUID => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(Value::Uuid),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(Value::TimestampTz),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(Value::Date),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(Value::Json),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        _ if TextLike::accepts(ty) => row
            .try_get::<_, Option<TextLike>>(idx)?
            .map(|text| Value::Text(text.0)),
        _ => return Ok(None),
    };
    Ok(Some(value.unwrap_or(Value::Null)))
}

/// Writes to the destination table.
pub struct PgDestination {
    session: PgSession,
}

impl PgDestination {
    pub fn new(session: PgSession) -> Self {
        Self { session }
    }

    /// Run one write statement in its own transaction.
    async fn execute_in_transaction(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
        what: &str,
    ) -> Result<u64, StoreError> {
        let transaction = self
            .session
            .client_mut()
            .transaction()
            .await
            .map_err(|e| backend(e, "Failed to begin transaction"))?;

        let affected = match transaction.execute(query, params).await {
            Ok(affected) => affected,
            Err(e) => {
                // Dropping the transaction rolls it back.
                return Err(classify_write_error(e, what));
            }
        };

        transaction
            .commit()
            .await
            .map_err(|e| classify_write_error(e, "Failed to commit"))?;

        Ok(affected)
    }
}

fn classify_write_error(err: tokio_postgres::Error, what: &str) -> StoreError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let detail = err
            .as_db_error()
            .and_then(|db| db.detail().map(str::to_string))
            .unwrap_or_else(|| err.to_string());
        return StoreError::UniqueViolation { detail };
    }
    backend(err, what)
}

/// Column-major text arrays for an UNNEST statement.
fn text_columns(rows: &WriteSet) -> Vec<Vec<Option<String>>> {
    let mut columns: Vec<Vec<Option<String>>> =
        vec![Vec::with_capacity(rows.len()); rows.columns.len()];
    for row in &rows.rows {
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(value.to_pg_text());
        }
    }
    columns
}

fn column_type<'a>(layout: &'a TableLayout, column: &str) -> Result<&'a str, StoreError> {
    layout.type_of(column).ok_or_else(|| {
        StoreError::backend(format!(
            "Column '{}' not found in {}",
            column, layout.table
        ))
    })
}

impl DestinationStore for PgDestination {
    async fn describe_table(&mut self, table: &TableName) -> Result<Option<TableLayout>, StoreError> {
        let client = self.session.client();

        let exists: bool = client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = COALESCE($1::text, current_schema())
                      AND table_name = $2::text
                )",
                &[&table.schema, &table.name],
            )
            .await
            .map_err(|e| backend(e, "Failed to check if destination table exists"))?
            .get(0);

        if !exists {
            return Ok(None);
        }

        let rows = client
            .query(
                "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
                 FROM pg_attribute a
                 WHERE a.attrelid = $1::text::regclass
                   AND a.attnum > 0
                   AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&table.quoted()],
            )
            .await
            .map_err(|e| backend(e, format!("Failed to get columns for {}", table)))?;

        Ok(Some(TableLayout {
            table: table.clone(),
            columns: rows.iter().map(|row| (row.get(0), row.get(1))).collect(),
        }))
    }

    async fn lookup_keys(
        &mut self,
        layout: &TableLayout,
        key_column: &str,
        keys: &[ReferenceKey],
    ) -> Result<KeyLookup, StoreError> {
        if keys.is_empty() {
            return Ok(KeyLookup::new());
        }

        let query = build_membership_query(layout, key_column)?;
        let ids: Vec<&str> = keys.iter().map(ReferenceKey::as_str).collect();

        let rows = self
            .session
            .client()
            .query(&query, &[&ids])
            .await
            .map_err(|e| backend(e, format!("Failed to look up references in {}", layout.table)))?;

        let mut lookup = KeyLookup::new();
        for row in &rows {
            lookup.insert(
                ReferenceKey::new(row.get::<_, String>(0)),
                ReferenceKey::new(row.get::<_, String>(1)),
                row.get(2),
            );
        }
        Ok(lookup)
    }

    async fn key_is_unique(&mut self, layout: &TableLayout, column: &str) -> Result<bool, StoreError> {
        let row = self
            .session
            .client()
            .query_one(
                "SELECT EXISTS (
                    SELECT 1
                    FROM pg_index i
                    JOIN pg_attribute a
                      ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                    WHERE i.indrelid = $1::text::regclass
                      AND i.indisunique
                      AND i.indnatts = 1
                      AND i.indpred IS NULL
                      AND a.attname::text = $2::text
                )",
                &[&layout.table.quoted(), &column],
            )
            .await
            .map_err(|e| backend(e, format!("Failed to inspect indexes on {}", layout.table)))?;
        Ok(row.get(0))
    }

    async fn update_rows(&mut self, layout: &TableLayout, rows: &WriteSet) -> Result<u64, StoreError> {
        let Some(query) = build_update_query(layout, &rows.columns)? else {
            tracing::debug!(
                "Only the key column is mapped; nothing to update in {}",
                layout.table
            );
            return Ok(0);
        };

        let columns = text_columns(rows);
        let params: Vec<&(dyn ToSql + Sync)> =
            columns.iter().map(|c| c as &(dyn ToSql + Sync)).collect();

        self.execute_in_transaction(
            &query,
            &params,
            &format!("Failed to update rows in {}", layout.table),
        )
        .await
    }

    async fn insert_rows(&mut self, layout: &TableLayout, rows: &WriteSet) -> Result<u64, StoreError> {
        let query = build_insert_query(layout, &rows.columns)?;

        let columns = text_columns(rows);
        let params: Vec<&(dyn ToSql + Sync)> =
            columns.iter().map(|c| c as &(dyn ToSql + Sync)).collect();

        self.execute_in_transaction(
            &query,
            &params,
            &format!("Failed to insert rows into {}", layout.table),
        )
        .await
    }

    async fn close(self) {
        self.session.close().await;
    }
}

/// Build the bulk membership query.
///
/// ```sql
/// SELECT k.requested, k.requested::bigint::text,
///        EXISTS (SELECT 1 FROM "execution_history" t
///                WHERE t."reference_id" = k.requested::bigint)
/// FROM UNNEST($1::text[]) AS k(requested)
/// ```
///
/// Keys travel as text and are cast to the column type server-side, so they
/// compare as the column's values (`007` finds bigint `7`) and the unique
/// index on the key column is still used. Each row returns the key as sent,
/// its canonical text in the column type, and whether it exists.
fn build_membership_query(layout: &TableLayout, key_column: &str) -> Result<String, StoreError> {
    let key_type = column_type(layout, key_column)?;
    Ok(format!(
        "SELECT k.requested, k.requested::{key_type}::text, \
         EXISTS (SELECT 1 FROM {table} t WHERE t.{key} = k.requested::{key_type}) \
         FROM UNNEST($1::text[]) AS k(requested)",
        key = quote_ident(key_column),
        table = layout.table.quoted(),
        key_type = key_type
    ))
}

/// `UNNEST($1::text[], $2::text[], ...) AS v("c1", "c2", ...)`
fn unnest_source(columns: &[String]) -> String {
    let arrays: Vec<String> = (1..=columns.len())
        .map(|i| format!("${}::text[]", i))
        .collect();
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!("UNNEST({}) AS v({})", arrays.join(", "), names.join(", "))
}

/// Build the bulk update keyed on the first column.
///
/// ```sql
/// UPDATE "execution_history" AS t
/// SET "status" = v."status"::text, ...
/// FROM UNNEST($1::text[], $2::text[], ...) AS v("reference_id", "status", ...)
/// WHERE t."reference_id" = v."reference_id"::bigint
/// ```
///
/// Returns `None` when only the key column is mapped.
fn build_update_query(layout: &TableLayout, columns: &[String]) -> Result<Option<String>, StoreError> {
    let Some((key_column, value_columns)) = columns.split_first() else {
        return Ok(None);
    };
    if value_columns.is_empty() {
        return Ok(None);
    }

    let assignments = value_columns
        .iter()
        .map(|c| {
            Ok(format!(
                "{col} = v.{col}::{ty}",
                col = quote_ident(c),
                ty = column_type(layout, c)?
            ))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(Some(format!(
        "UPDATE {table} AS t SET {assignments} FROM {source} WHERE t.{key} = v.{key}::{key_type}",
        table = layout.table.quoted(),
        assignments = assignments.join(", "),
        source = unnest_source(columns),
        key = quote_ident(key_column),
        key_type = column_type(layout, key_column)?
    )))
}

/// Build the bulk insert.
///
/// ```sql
/// INSERT INTO "execution_history" ("reference_id", "status", ...)
/// SELECT v."reference_id"::bigint, v."status"::text, ...
/// FROM UNNEST($1::text[], $2::text[], ...) AS v("reference_id", "status", ...)
/// ```
fn build_insert_query(layout: &TableLayout, columns: &[String]) -> Result<String, StoreError> {
    let targets: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let selects = columns
        .iter()
        .map(|c| Ok(format!("v.{}::{}", quote_ident(c), column_type(layout, c)?)))
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        layout.table.quoted(),
        targets.join(", "),
        selects.join(", "),
        unnest_source(columns)
    ))
}
