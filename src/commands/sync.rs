// ABOUTME: Sync command - runs the cycle driver once or until Ctrl+C
// ABOUTME: Prints the resolved configuration and per-run statistics

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::postgres::PgConnector;
use crate::sync::{CycleDriver, CycleStats, SyncPlan};

/// Run the sync driver described by `config`.
///
/// With `once` a single cycle runs and its failure is returned as an error.
/// Otherwise cycles repeat until Ctrl+C; failed cycles are logged and the
/// next one still runs.
pub async fn sync(config: SyncConfig, once: bool) -> Result<()> {
    let plan = SyncPlan::from_config(&config)?;
    let connector = PgConnector::new(&config.source_dsn, &config.destination_dsn);
    let mut driver = CycleDriver::new(connector, plan);

    if once {
        let stats = driver
            .run_cycle()
            .await
            .context("Sync cycle failed")?;
        print_cycle_summary(&stats);
        return Ok(());
    }

    println!("========================================");
    println!("Starting continuous execution sync");
    println!("========================================");
    for (label, value) in config.summary() {
        println!("  {}: {}", label, value);
    }
    println!("  Press Ctrl+C to stop");
    println!();

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal, finishing current cycle"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });

    driver.run(cancel).await?;

    let counters = driver.counters();
    println!();
    println!("========================================");
    println!("Execution sync stopped");
    println!("========================================");
    println!("  Cycles run: {}", counters.cycles);
    println!("  Cycles failed: {}", counters.failed_cycles);
    println!("  Insert conflicts: {}", counters.conflicts);

    Ok(())
}

fn print_cycle_summary(stats: &CycleStats) {
    println!("========================================");
    println!("Sync cycle complete");
    println!("========================================");
    println!("  Records extracted: {}", stats.extracted);
    println!("  Already present: {}", stats.present);
    println!("  New: {}", stats.absent);
    println!("  Rows updated: {}", stats.updated);
    println!("  Rows inserted: {}", stats.inserted);
    println!("  Duration: {}ms", stats.duration_ms);
    if stats.is_noop() {
        println!("  Nothing to write");
    }
}
