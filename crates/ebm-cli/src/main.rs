use anyhow::Result;
use clap::{Parser, Subcommand};
use ebm_storage::{ensure_schema, reflag, DbSession};
use ebm_sync::{maybe_build_scheduler, run_sync_once_from_env, SyncConfig};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ebm-cli")]
#[command(about = "ESPM benchmarking mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull the benchmark report once and merge it into the mirror table.
    Sync,
    /// Create or evolve the mirror table without syncing.
    Migrate,
    /// Recompute the has_issue flag across all stored rows.
    Reflag,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} staged={} committed={} reflagged={} reports={}",
                summary.run_id,
                summary.staged_rows,
                summary.committed_rows,
                summary.reflagged_rows,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let mut session =
                DbSession::connect_with_retry(&config.database_url, config.backoff()).await?;
            ensure_schema(&mut session).await?;
            session.close().await?;
            println!("schema ensured");
        }
        Commands::Reflag => {
            let config = SyncConfig::from_env();
            let mut session =
                DbSession::connect_with_retry(&config.database_url, config.backoff()).await?;
            let changed = reflag(&mut session).await?;
            session.close().await?;
            println!("reflag complete: {changed} rows changed");
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            match maybe_build_scheduler(&config).await? {
                Some(sched) => {
                    sched.start().await?;
                    info!(
                        cron_1 = %config.sync_cron_1,
                        cron_2 = %config.sync_cron_2,
                        "scheduler running; ctrl-c to stop"
                    );
                    tokio::signal::ctrl_c().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set EBM_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
