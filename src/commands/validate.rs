// ABOUTME: Validate command - checks both databases are ready for syncing
// ABOUTME: Connects, runs the pre-flight checks, and fails if any check fails

use anyhow::{bail, Result};

use crate::config::SyncConfig;
use crate::postgres::PgConnector;
use crate::preflight::{check_destination, check_source, CheckResult, PreflightReport};
use crate::sync::{Connector, DestinationStore, SourceStore, SyncPlan};

pub async fn validate(config: SyncConfig) -> Result<()> {
    let plan = SyncPlan::from_config(&config)?;
    let connector = PgConnector::new(&config.source_dsn, &config.destination_dsn);

    println!("Validating execution sync configuration...");
    for (label, value) in config.summary() {
        println!("  {}: {}", label, value);
    }

    let mut report = PreflightReport::new();

    tracing::info!("Checking source database...");
    match connector.open_source().await {
        Ok(mut source) => {
            report
                .connections
                .push(CheckResult::pass("source", "Connected to source"));
            report.source = check_source(&plan, &mut source).await;
            source.close().await;
        }
        Err(e) => report.connections.push(
            CheckResult::fail("source", "Cannot connect to source").with_details(format!("{:#}", e)),
        ),
    }

    tracing::info!("Checking destination database...");
    match connector.open_destination().await {
        Ok(mut destination) => {
            report
                .connections
                .push(CheckResult::pass("destination", "Connected to destination"));
            report.destination = check_destination(&plan, &mut destination).await;
            destination.close().await;
        }
        Err(e) => report.connections.push(
            CheckResult::fail("destination", "Cannot connect to destination")
                .with_details(format!("{:#}", e)),
        ),
    }

    report.print();

    if !report.all_passed() {
        bail!(
            "Validation failed: {} check(s) failed",
            report.failed_count()
        );
    }

    Ok(())
}
