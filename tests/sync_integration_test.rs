// ABOUTME: Integration tests for execution sync against real PostgreSQL
// ABOUTME: Covers insert/update partitioning, idempotence, conflicts, key typing, and bad records

use execution_replicator::postgres::{connect, PgConnector, PgSession};
use execution_replicator::sync::{
    resolve_layout, sync_once, Batch, ChangeWriter, ColumnMapping, Connector, CycleDriver,
    DestinationStore, Record, ReferenceKey, SourceStore, SyncError, SyncPlan, TableName, Value,
};
use std::env;
use std::time::Duration;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((source, target))
}

/// Source and destination table names unique to one test run
fn test_tables(suffix: &str) -> (String, String) {
    let id = uuid::Uuid::new_v4().simple().to_string();
    (
        format!("executions_{}_{}", suffix, &id[..8]),
        format!("execution_history_{}_{}", suffix, &id[..8]),
    )
}

struct Fixture {
    source: PgSession,
    target: PgSession,
    source_table: String,
    target_table: String,
    plan: SyncPlan,
    connector: PgConnector,
}

impl Fixture {
    async fn new(suffix: &str) -> anyhow::Result<Self> {
        let (source_url, target_url) =
            get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
        let (source_table, target_table) = test_tables(suffix);

        let source = connect(&source_url).await?;
        let target = connect(&target_url).await?;

        source
            .client()
            .batch_execute(&format!(
                r#"
                CREATE TABLE "public"."{}" (
                    id BIGINT,
                    label TEXT,
                    machine_id TEXT,
                    start_time TIMESTAMP,
                    end_time TIMESTAMP,
                    status TEXT
                )
                "#,
                source_table
            ))
            .await?;
        target
            .client()
            .batch_execute(&format!(
                r#"
                CREATE TABLE "public"."{0}" (
                    history_id SERIAL PRIMARY KEY,
                    reference_id BIGINT NOT NULL,
                    label TEXT,
                    machine_id TEXT,
                    start_time TIMESTAMP,
                    end_time TIMESTAMP,
                    status TEXT
                );
                CREATE UNIQUE INDEX ON "public"."{0}" (reference_id);
                "#,
                target_table
            ))
            .await?;

        let plan = SyncPlan {
            source_query: format!(
                r#"SELECT id AS reference_id, label, machine_id, start_time, end_time, status FROM "public"."{}""#,
                source_table
            ),
            table: TableName::parse(&format!("public.{}", target_table))?,
            mapping: ColumnMapping::default(),
            poll_interval: Duration::from_millis(100),
        };

        Ok(Self {
            source,
            target,
            source_table,
            target_table,
            plan,
            connector: PgConnector::new(source_url, target_url),
        })
    }

    async fn source_exec(&self, sql: &str) -> anyhow::Result<()> {
        self.source
            .client()
            .batch_execute(&sql.replace("{source}", &self.source_table))
            .await?;
        Ok(())
    }

    async fn target_exec(&self, sql: &str) -> anyhow::Result<()> {
        self.target
            .client()
            .batch_execute(&sql.replace("{target}", &self.target_table))
            .await?;
        Ok(())
    }

    /// (reference_id, status) pairs in the destination, ordered by reference_id
    async fn destination_rows(&self) -> anyhow::Result<Vec<(i64, Option<String>)>> {
        let rows = self
            .target
            .client()
            .query(
                &format!(
                    r#"SELECT reference_id, status FROM "public"."{}" ORDER BY reference_id"#,
                    self.target_table
                ),
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn cleanup(self) {
        let _ = self
            .source
            .client()
            .batch_execute(&format!(
                r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#,
                self.source_table
            ))
            .await;
        let _ = self
            .target
            .client()
            .batch_execute(&format!(
                r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#,
                self.target_table
            ))
            .await;
        self.source.close().await;
        self.target.close().await;
    }
}

#[tokio::test]
#[ignore]
async fn test_cycle_updates_present_and_inserts_absent() {
    let fixture = Fixture::new("scenario").await.unwrap();

    fixture
        .source_exec(
            "INSERT INTO \"public\".\"{source}\" VALUES \
             (1, 'invoice-bot', 'vm-01', '2024-03-01 10:00:00', '2024-03-01 10:05:00', 'completed'), \
             (2, 'invoice-bot', 'vm-02', '2024-03-01 11:00:00', NULL, 'running'), \
             (3, 'payroll', 'vm-01', '2024-03-01 12:00:00', NULL, 'queued')",
        )
        .await
        .unwrap();
    fixture
        .target_exec(
            "INSERT INTO \"public\".\"{target}\" (reference_id, status) VALUES (2, 'queued'), (9, 'archived')",
        )
        .await
        .unwrap();

    let mut driver = CycleDriver::new(fixture.connector.clone(), fixture.plan.clone());
    let stats = driver.run_cycle().await.unwrap();

    assert_eq!(stats.extracted, 3);
    assert_eq!(stats.present, 1);
    assert_eq!(stats.absent, 2);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.inserted, 2);

    let rows = fixture.destination_rows().await.unwrap();
    assert_eq!(
        rows,
        vec![
            (1, Some("completed".to_string())),
            (2, Some("running".to_string())),
            (3, Some("queued".to_string())),
            (9, Some("archived".to_string())),
        ]
    );

    // Timestamps survive the text round trip
    let row = fixture
        .target
        .client()
        .query_one(
            &format!(
                r#"SELECT start_time::text, end_time FROM "public"."{}" WHERE reference_id = 1"#,
                fixture.target_table
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>(0), "2024-03-01 10:00:00");

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_second_cycle_is_idempotent() {
    let fixture = Fixture::new("idempotent").await.unwrap();

    fixture
        .source_exec(
            "INSERT INTO \"public\".\"{source}\" (id, label, status) VALUES \
             (10, 'a', 'completed'), (11, 'b', 'failed')",
        )
        .await
        .unwrap();

    let mut driver = CycleDriver::new(fixture.connector.clone(), fixture.plan.clone());
    let first = driver.run_cycle().await.unwrap();
    assert_eq!(first.inserted, 2);
    let after_first = fixture.destination_rows().await.unwrap();

    let second = driver.run_cycle().await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 2);
    assert_eq!(fixture.destination_rows().await.unwrap(), after_first);

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_insert_conflict_rolls_back_whole_batch() {
    let fixture = Fixture::new("conflict").await.unwrap();
    fixture
        .target_exec("INSERT INTO \"public\".\"{target}\" (reference_id, status) VALUES (21, 'theirs')")
        .await
        .unwrap();

    let mut destination = fixture.connector.open_destination().await.unwrap();
    let layout = resolve_layout(&fixture.plan, &mut destination).await.unwrap();
    assert!(destination
        .key_is_unique(&layout, "reference_id")
        .await
        .unwrap());

    // 21 was classified absent before another writer inserted it
    let absent = Batch::from(vec![
        Record::from_pairs([("reference_id", Value::Int(20)), ("status", Value::from("ours"))]),
        Record::from_pairs([("reference_id", Value::Int(21)), ("status", Value::from("ours"))]),
    ]);

    let err = ChangeWriter::new(&mut destination, &layout, &fixture.plan.mapping)
        .apply_inserts(&absent)
        .await
        .unwrap_err();
    destination.close().await;

    match err {
        SyncError::Conflict {
            references,
            attempted,
            ..
        } => {
            assert_eq!(references, vec![ReferenceKey::new("21")]);
            assert_eq!(attempted, 2);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(
        fixture.destination_rows().await.unwrap(),
        vec![(21, Some("theirs".to_string()))]
    );

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_null_reference_aborts_cycle_without_writes() {
    let fixture = Fixture::new("nullkey").await.unwrap();
    fixture
        .source_exec(
            "INSERT INTO \"public\".\"{source}\" (id, status) VALUES (30, 'completed'), (NULL, 'completed')",
        )
        .await
        .unwrap();

    let mut source = fixture.connector.open_source().await.unwrap();
    let mut destination = fixture.connector.open_destination().await.unwrap();
    let err = sync_once(&fixture.plan, &mut source, &mut destination)
        .await
        .unwrap_err();
    source.close().await;
    destination.close().await;

    assert!(matches!(err, SyncError::Schema(_)), "got {:?}", err);
    assert!(fixture.destination_rows().await.unwrap().is_empty());

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_missing_destination_table_is_schema_error() {
    let fixture = Fixture::new("missing").await.unwrap();
    let mut plan = fixture.plan.clone();
    plan.table = TableName::parse("public.execution_history_does_not_exist").unwrap();

    let mut driver = CycleDriver::new(fixture.connector.clone(), plan);
    let err = driver.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Schema(_)), "got {:?}", err);
    assert_eq!(driver.counters().failed_cycles, 1);

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_source_decodes_common_types() {
    let fixture = Fixture::new("types").await.unwrap();
    let mut source = fixture.connector.open_source().await.unwrap();

    let batch = source
        .fetch(
            "SELECT 7::bigint AS reference_id, 2.50::numeric AS cost, true AS ok, \
             '2024-03-01'::date AS day, '{\"a\":1}'::jsonb AS meta, NULL::text AS note",
        )
        .await
        .unwrap();
    source.close().await;

    assert_eq!(batch.columns(), ["reference_id", "cost", "ok", "day", "meta", "note"]);
    let record = &batch.records()[0];
    assert_eq!(record.get("reference_id"), Some(&Value::Int(7)));
    assert_eq!(record.get("ok"), Some(&Value::Bool(true)));
    assert_eq!(record.get("note"), Some(&Value::Null));
    assert_eq!(
        record.get("cost").and_then(Value::to_pg_text).as_deref(),
        Some("2.50")
    );

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_text_source_keys_match_bigint_destination() {
    let fixture = Fixture::new("textkey").await.unwrap();
    fixture
        .source_exec(
            "ALTER TABLE \"public\".\"{source}\" ALTER COLUMN id TYPE TEXT; \
             INSERT INTO \"public\".\"{source}\" (id, status) VALUES ('007', 'running'), ('8', 'done')",
        )
        .await
        .unwrap();
    fixture
        .target_exec("INSERT INTO \"public\".\"{target}\" (reference_id, status) VALUES (7, 'queued')")
        .await
        .unwrap();

    let mut driver = CycleDriver::new(fixture.connector.clone(), fixture.plan.clone());
    let first = driver.run_cycle().await.unwrap();
    assert_eq!((first.present, first.absent), (1, 1));
    assert_eq!((first.updated, first.inserted), (1, 1));

    let second = driver.run_cycle().await.unwrap();
    assert_eq!((second.present, second.absent), (2, 0));
    assert_eq!((second.updated, second.inserted), (2, 0));
    assert_eq!(driver.counters().failed_cycles, 0);

    assert_eq!(
        fixture.destination_rows().await.unwrap(),
        vec![(7, Some("running".to_string())), (8, Some("done".to_string()))]
    );

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_uppercase_uuid_text_matches_uuid_destination() {
    let fixture = Fixture::new("uuidkey").await.unwrap();
    fixture
        .source_exec(
            "ALTER TABLE \"public\".\"{source}\" ALTER COLUMN id TYPE TEXT; \
             INSERT INTO \"public\".\"{source}\" (id, status) \
             VALUES ('A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11', 'running')",
        )
        .await
        .unwrap();
    fixture
        .target_exec(
            "ALTER TABLE \"public\".\"{target}\" ALTER COLUMN reference_id TYPE UUID USING NULL; \
             INSERT INTO \"public\".\"{target}\" (reference_id, status) \
             VALUES ('a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11', 'queued')",
        )
        .await
        .unwrap();

    let mut driver = CycleDriver::new(fixture.connector.clone(), fixture.plan.clone());
    for _ in 0..2 {
        let stats = driver.run_cycle().await.unwrap();
        assert_eq!((stats.present, stats.absent), (1, 0));
        assert_eq!((stats.updated, stats.inserted), (1, 0));
    }

    let rows = fixture
        .target
        .client()
        .query(
            &format!(
                r#"SELECT reference_id::text, status FROM "public"."{}""#,
                fixture.target_table
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, String>(0), "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11");
    assert_eq!(rows[0].get::<_, String>(1), "running");

    fixture.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn test_source_decodes_enum_as_text() {
    let fixture = Fixture::new("enums").await.unwrap();
    let enum_type = format!("execution_status_{}", &fixture.source_table[fixture.source_table.len() - 8..]);
    fixture
        .source
        .client()
        .batch_execute(&format!(
            "CREATE TYPE \"public\".\"{}\" AS ENUM ('queued', 'running', 'done')",
            enum_type
        ))
        .await
        .unwrap();

    let mut source = fixture.connector.open_source().await.unwrap();
    let batch = source
        .fetch(&format!(
            "SELECT 7::bigint AS reference_id, 'running'::\"public\".\"{}\" AS status",
            enum_type
        ))
        .await
        .unwrap();
    let err = source
        .fetch("SELECT 7::bigint AS reference_id, interval '5 minutes' AS elapsed")
        .await
        .unwrap_err();
    source.close().await;

    assert_eq!(batch.records()[0].get("status"), Some(&Value::from("running")));
    let message = format!("{:#}", err);
    assert!(message.contains("elapsed"), "{}", message);
    assert!(message.contains("interval"), "{}", message);
    assert!(message.contains("elapsed::text"), "{}", message);

    let _ = fixture
        .source
        .client()
        .batch_execute(&format!("DROP TYPE IF EXISTS \"public\".\"{}\"", enum_type))
        .await;
    fixture.cleanup().await;
}
