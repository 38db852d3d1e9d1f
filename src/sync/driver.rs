// ABOUTME: CycleDriver - runs extract, reconcile, write passes on a fixed interval
// ABOUTME: Owns connection lifetime per cycle and isolates failures between cycles

use anyhow::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::error::{StoreError, StoreSide, SyncError};
use super::extractor::Extractor;
use super::mapping::ColumnMapping;
use super::reconciler::Reconciler;
use super::store::{DestinationStore, SourceStore, TableLayout, TableName};
use super::writer::ChangeWriter;
use crate::config::SyncConfig;

/// Opens the two connections a cycle needs.
pub trait Connector: Send + Sync {
    type Source: SourceStore;
    type Destination: DestinationStore;

    fn open_source(&self) -> impl Future<Output = Result<Self::Source>> + Send;

    fn open_destination(&self) -> impl Future<Output = Result<Self::Destination>> + Send;
}

/// What a cycle reads and where it writes. Built once from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub source_query: String,
    pub table: TableName,
    pub mapping: ColumnMapping,
    pub poll_interval: Duration,
}

impl SyncPlan {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            source_query: config.source_query.clone(),
            table: TableName::parse(&config.destination_table)?,
            mapping: config.column_mapping()?,
            poll_interval: config.poll_interval(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
}

/// Statistics from one successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub extracted: usize,
    pub present: usize,
    pub absent: usize,
    pub updated: u64,
    pub inserted: u64,
    pub duration_ms: u64,
}

impl CycleStats {
    /// True if the cycle wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.updated == 0 && self.inserted == 0
    }
}

/// Running totals across the life of a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCounters {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub conflicts: u64,
}

/// Drives sync cycles: `Idle -> Running -> Idle`, then waits the poll interval.
///
/// Cycles never overlap. Both connections are released on every exit path of
/// a cycle before the driver returns to `Idle`. Errors abort only the cycle
/// that raised them.
pub struct CycleDriver<C> {
    connector: C,
    plan: SyncPlan,
    state: DriverState,
    counters: DriverCounters,
}

impl<C: Connector> CycleDriver<C> {
    pub fn new(connector: C, plan: SyncPlan) -> Self {
        Self {
            connector,
            plan,
            state: DriverState::Idle,
            counters: DriverCounters::default(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn counters(&self) -> DriverCounters {
        self.counters
    }

    pub fn plan(&self) -> &SyncPlan {
        &self.plan
    }

    /// Run a single extract -> reconcile -> write pass.
    pub async fn run_cycle(&mut self) -> Result<CycleStats, SyncError> {
        let start = Instant::now();
        self.state = DriverState::Running;
        self.counters.cycles += 1;

        let result = self.open_and_sync().await;

        self.state = DriverState::Idle;
        match result {
            Ok(mut stats) => {
                stats.duration_ms = start.elapsed().as_millis() as u64;
                Ok(stats)
            }
            Err(e) => {
                self.counters.failed_cycles += 1;
                if e.is_conflict() {
                    self.counters.conflicts += 1;
                }
                Err(e)
            }
        }
    }

    async fn open_and_sync(&self) -> Result<CycleStats, SyncError> {
        let mut source = self
            .connector
            .open_source()
            .await
            .map_err(|e| SyncError::Connect {
                side: StoreSide::Source,
                source: StoreError::Backend(e),
            })?;

        let mut destination = match self.connector.open_destination().await {
            Ok(destination) => destination,
            Err(e) => {
                source.close().await;
                return Err(SyncError::Connect {
                    side: StoreSide::Destination,
                    source: StoreError::Backend(e),
                });
            }
        };

        let result = sync_once(&self.plan, &mut source, &mut destination).await;

        source.close().await;
        destination.close().await;

        result
    }

    /// Run cycles until `cancel` fires.
    ///
    /// The first cycle starts immediately. Cancellation is observed between
    /// cycles only: a cycle in progress finishes (or fails) before the driver
    /// stops.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            "Starting sync driver: {} every {:?}",
            self.plan.table,
            self.plan.poll_interval
        );

        while !cancel.is_cancelled() {
            let cycle = self.counters.cycles + 1;
            tracing::info!("Starting sync cycle {}", cycle);

            match self.run_cycle().await {
                Ok(stats) => {
                    tracing::info!(
                        "Sync cycle {} completed: {} extracted, {} updated, {} inserted in {}ms",
                        cycle,
                        stats.extracted,
                        stats.updated,
                        stats.inserted,
                        stats.duration_ms
                    );
                }
                Err(SyncError::Conflict {
                    detail,
                    references,
                    attempted,
                }) => {
                    tracing::warn!(
                        "Sync cycle {} hit a concurrent insert on reference {} ({}); {} new records left for the next cycle",
                        cycle,
                        references
                            .iter()
                            .map(|r| r.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        detail,
                        attempted
                    );
                }
                Err(e) => {
                    // Log with :? to show full error chain including root cause
                    tracing::error!("Sync cycle {} failed ({}): {:?}", cycle, e.kind(), e);
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.plan.poll_interval) => {}
            }
        }

        tracing::info!(
            "Shutdown requested, sync driver stopped after {} cycles ({} failed)",
            self.counters.cycles,
            self.counters.failed_cycles
        );
        Ok(())
    }
}

/// One cycle's work against already-open stores.
pub async fn sync_once<S, D>(
    plan: &SyncPlan,
    source: &mut S,
    destination: &mut D,
) -> Result<CycleStats, SyncError>
where
    S: SourceStore,
    D: DestinationStore,
{
    let layout = resolve_layout(plan, destination).await?;

    let batch = Extractor::new(source).extract(&plan.source_query).await?;
    let extracted = batch.len();

    let result = Reconciler::new(&plan.mapping)
        .reconcile(batch, destination, &layout)
        .await?;

    let mut writer =
        ChangeWriter::new(destination, &layout, &plan.mapping).with_identities(&result.lookup);
    let updated = writer.apply_updates(&result.present).await?;
    let inserted = writer.apply_inserts(&result.absent).await?;

    Ok(CycleStats {
        extracted,
        present: result.present.len(),
        absent: result.absent.len(),
        updated,
        inserted,
        duration_ms: 0,
    })
}

/// Look up the destination table and check it has every mapped column.
pub async fn resolve_layout<D: DestinationStore>(
    plan: &SyncPlan,
    destination: &mut D,
) -> Result<TableLayout, SyncError> {
    let layout = destination
        .describe_table(&plan.table)
        .await
        .map_err(SyncError::Lookup)?
        .ok_or_else(|| {
            SyncError::Schema(format!(
                "destination table {} does not exist",
                plan.table
            ))
        })?;

    let required = plan.mapping.destination_columns();
    let missing = layout.missing(&required);
    if !missing.is_empty() {
        return Err(SyncError::Schema(format!(
            "destination table {} is missing columns: {}",
            plan.table,
            missing.join(", ")
        )));
    }

    Ok(layout)
}
