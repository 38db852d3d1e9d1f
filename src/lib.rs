// ABOUTME: Library root for execution-replicator
// ABOUTME: Exposes the sync engine, configuration, and PostgreSQL adapters

pub mod commands;
pub mod config;
pub mod postgres;
pub mod preflight;
pub mod sync;
pub mod utils;

pub use config::SyncConfig;
pub use sync::{CycleDriver, CycleStats, DriverState, SyncError};
