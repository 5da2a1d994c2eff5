use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use wotrack_storage::PgStore;
use wotrack_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "wotrack-cli")]
#[command(about = "Field service work order tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one spreadsheet snapshot.
    Sync {
        /// Snapshot JSON to ingest instead of WOTRACK_SNAPSHOT_PATH.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// One-shot merge of legacy technicians into team actors.
    MergeIdentities,
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match cli.command.unwrap_or(Commands::Sync { snapshot: None }) {
        Commands::Sync { snapshot } => {
            let summary = wotrack_sync::run_sync_once_from_env(snapshot).await?;
            info!(
                run_id = %summary.run_id,
                status = ?summary.status,
                rows = summary.total_rows,
                inserted = summary.counts.inserted,
                updated = summary.counts.updated,
                unchanged = summary.counts.unchanged,
                skipped = summary.counts.skipped,
                "sync finished"
            );
            if !summary.failures.is_empty() {
                warn!(count = summary.failures.len(), "rows were skipped");
                println!("{}", serde_json::to_string_pretty(&summary.failures)?);
            }
            if summary.status == wotrack_sync::SyncStatus::Error {
                bail!(summary.message);
            }
        }
        Commands::MergeIdentities => {
            let report = wotrack_identity::run_merge_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.failures.is_empty() {
                bail!(
                    "identity merge left {} failure(s); fix them and rerun",
                    report.failures.len()
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            wotrack_web::serve_from_env().await?;
        }
    }

    Ok(())
}
