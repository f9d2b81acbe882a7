use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use tidemark_core::RunParams;
use tidemark_sync::{
    build_pipeline_from_env, maybe_build_scheduler, run_sync_once_from_env, CancelFlag,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tidemark")]
#[command(about = "Marketplace sync pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync over every enabled account.
    Sync {
        /// Window start (RFC 3339 or YYYY-MM-DD); defaults to the
        /// watermark, falling back to the recent-hours window.
        #[arg(long)]
        from: Option<String>,
        /// Window end (RFC 3339 or YYYY-MM-DD); defaults to now.
        #[arg(long)]
        to: Option<String>,
        /// Sync the last N days instead of the watermark.
        #[arg(long)]
        days: Option<i64>,
        /// Ignore watermarks and sync from the beginning of time.
        #[arg(long)]
        full: bool,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn parse_bound(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("expected RFC 3339 or YYYY-MM-DD, got {raw}"))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    match cli.command.unwrap_or(Commands::Sync {
        from: None,
        to: None,
        days: None,
        full: false,
    }) {
        Commands::Sync { from, to, days, full } => {
            let params = RunParams {
                from_date: from.as_deref().map(parse_bound).transpose()?,
                to_date: to.as_deref().map(parse_bound).transpose()?,
                days,
                full_sync: full,
            };
            let summary = run_sync_once_from_env(&params, cancel).await?;
            println!(
                "sync complete: run_id={} accounts={} seen={} written={} skipped={} errors={}",
                summary.run_id,
                summary.stats.accounts_processed,
                summary.stats.records_seen,
                summary.stats.records_written,
                summary.stats.records_skipped,
                summary.stats.errors.len()
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline_from_env(cancel).await?);
            match maybe_build_scheduler(pipeline).await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for interrupt")?;
                }
                None => {
                    eprintln!("scheduler disabled; set TIDEMARK_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
