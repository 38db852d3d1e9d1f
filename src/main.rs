// ABOUTME: CLI entry point for execution-replicator
// ABOUTME: Parses commands, resolves configuration, and routes to handlers

use clap::{Args, Parser, Subcommand};
use execution_replicator::commands;
use execution_replicator::config::{ConfigOverrides, SyncConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "execution-replicator")]
#[command(
    about = "Replicate execution records from an RPA database into an execution history table",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// Path to a TOML config file
    #[arg(long = "config", env = "EXECUTION_REPLICATOR_CONFIG")]
    config_path: Option<PathBuf>,
    /// Source database connection string
    #[arg(long, env = "EXECUTION_REPLICATOR_SOURCE")]
    source: Option<String>,
    /// Destination database connection string
    #[arg(long, env = "EXECUTION_REPLICATOR_TARGET")]
    target: Option<String>,
    /// Read-only query producing one row per execution
    #[arg(long)]
    query: Option<String>,
    /// Destination table (table or schema.table)
    #[arg(long)]
    table: Option<String>,
}

impl ConfigArgs {
    fn resolve(self, interval: Option<u64>) -> anyhow::Result<SyncConfig> {
        SyncConfig::resolve(
            self.config_path.as_deref(),
            ConfigOverrides {
                source_dsn: self.source,
                destination_dsn: self.target,
                source_query: self.query,
                destination_table: self.table,
                poll_interval_secs: interval,
            },
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Pull execution records from the source and update or insert them into the destination
    Sync {
        #[command(flatten)]
        config: ConfigArgs,
        /// Seconds to wait after a cycle before starting the next (default: 2)
        #[arg(long)]
        interval: Option<u64>,
        /// Run a single sync cycle and exit (don't run continuously)
        #[arg(long)]
        once: bool,
    },
    /// Check that the source query and destination table are ready for syncing
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Write a commented starter config file
    InitConfig {
        /// Where to write the config file
        #[arg(long, default_value = "execution-replicator.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Sync {
            config,
            interval,
            once,
        } => {
            let config = config.resolve(interval)?;
            commands::sync(config, once).await
        }
        Commands::Validate { config } => {
            let config = config.resolve(None)?;
            commands::validate(config).await
        }
        Commands::InitConfig { output } => commands::init_config(&output),
    }
}
