use std::sync::Arc;

use adsync_core::{DateWindow, SourceSystem};
use adsync_storage::{DatabaseConfig, ReconStore};
use adsync_sync::{SyncConfig, SyncService};
use adsync_web::AppState;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "adsync")]
#[command(about = "Cross-network ad campaign sync and identity reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply schema migrations (safe to repeat).
    Migrate,
    /// Ingest every enabled network once.
    Sync {
        /// Limit the run to one network (slug or name).
        #[arg(long)]
        network: Option<SourceSystem>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Fill missing mapping networks from the latest fact rows.
    Backfill {
        #[arg(long)]
        network: Option<SourceSystem>,
    },
    /// Run the per-network cron schedules until interrupted.
    Schedule,
    /// Serve the read API (and schedules when ADSYNC_SCHEDULER_ENABLED is set).
    Serve,
    /// Print system status entries.
    Status {
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        network: None,
        from: None,
        to: None,
    }) {
        Commands::Migrate => {
            let store = connect(&config).await?;
            let report = store.migrate().await.context("applying migrations")?;
            println!(
                "migrate complete: applied_ops={} skipped_ops={} absorbed_conflicts={} new_versions={:?}",
                report.applied_ops,
                report.skipped_ops,
                report.absorbed_conflicts,
                report.newly_recorded
            );
        }
        Commands::Sync { network, from, to } => {
            let store = connect_migrated(&config).await?;
            let service = SyncService::from_config(config, store).await?;
            let window = match (from, to) {
                (Some(start), Some(end)) => DateWindow::new(start, end)?,
                _ => service.default_window(),
            };
            let summary = service.run_all_once(window, network).await?;
            println!(
                "sync complete: run_id={} window={}..{} networks={} summary={}",
                summary.run_id,
                summary.window.start,
                summary.window.end,
                summary.networks.len(),
                summary.summary_path
            );
            for entry in &summary.networks {
                println!(
                    "  {:<10} {}{}",
                    entry.network.slug(),
                    entry.status,
                    entry
                        .error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default()
                );
            }
            let failed = summary.failed_networks().count();
            if failed > 0 {
                bail!("{failed} network(s) did not complete");
            }
        }
        Commands::Backfill { network } => {
            let store = connect_migrated(&config).await?;
            let sources: Vec<SourceSystem> = match network {
                Some(source) => vec![source],
                None => SourceSystem::ALL
                    .into_iter()
                    .filter(|s| s.has_network_dimension())
                    .collect(),
            };
            for source in sources {
                let updated = store
                    .backfill_network(source)
                    .await
                    .with_context(|| format!("backfilling {}", source.slug()))?;
                println!("backfill {}: {updated} mapping(s) updated", source.slug());
            }
        }
        Commands::Schedule => {
            let store = connect_migrated(&config).await?;
            let service = SyncService::from_config(config, store).await?;
            let mut sched = service.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(networks = service.networks().len(), "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let store = connect_migrated(&config).await?;
            let service = SyncService::from_config(config, store.clone()).await?;
            let sched = service.maybe_build_scheduler().await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
            }
            adsync_web::serve(AppState::new(store), adsync_web::port_from_env()).await?;
        }
        Commands::Status { key } => {
            let store = connect(&config).await?;
            let entries = match key {
                Some(key) => vec![store.get_status(&key).await?],
                None => store.list_statuses().await?,
            };
            for entry in entries {
                println!(
                    "{} = {} (updated {})",
                    entry.status_key,
                    entry.status_value,
                    entry.updated_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<Arc<ReconStore>> {
    let mut db = DatabaseConfig::new(config.database_url.clone());
    db.max_connections = config.db_max_connections;
    let store = ReconStore::connect(&db)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}

/// Every long-running entry point migrates first; concurrent migrators
/// serialize on the advisory lock.
async fn connect_migrated(config: &SyncConfig) -> Result<Arc<ReconStore>> {
    let store = connect(config).await?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}
