use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use lume_sync::compat::SchemaStatus;
use lume_sync::config::{self, Config};
use lume_sync::db;
use lume_sync::migration::MigrationPlan;
use lume_sync::model::{EventStatus, OutboxEvent};
use lume_sync::outbox::OutboxRepository;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and repair the local outbox")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print event counts and list exhausted events
    Status {
        #[arg(long)]
        user: Option<String>,
    },
    /// Move failed events back to pending
    Retry {
        #[arg(long)]
        user: String,
        /// Also requeue events that used up their attempts
        #[arg(long)]
        force: bool,
        /// Event ids; all failed events of the user when omitted
        ids: Vec<String>,
    },
    /// Delete completed events past retention
    Purge {
        /// Override the configured retention window
        #[arg(long)]
        older_than_days: Option<i64>,
    },
    /// Report whether the store matches this build
    CheckSchema,
    /// Drop all local outbox data and recreate the schema
    Reset {
        /// Required; the reset cannot be undone
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    run(&cfg, args.command).await
}

async fn run(cfg: &Config, command: Command) -> Result<()> {
    let pool = db::init_pool(&cfg.database_url()).await?;
    let plan = MigrationPlan::standard();
    let repo = OutboxRepository::new(pool.clone(), cfg.retry_policy())
        .with_scan_limit(cfg.outbox.fallback_scan_limit);

    match command {
        Command::Status { user } => {
            let stats = repo.get_statistics(user.as_deref()).await?;
            for status in EventStatus::ALL {
                println!("{:<11} {}", status.as_str(), stats.count(status));
            }
            println!("{:<11} {}", "exhausted", stats.exhausted);
            println!("{:<11} {}", "total", stats.total());
            for ev in repo.fetch_exhausted_events(user.as_deref()).await? {
                print_event(&ev);
            }
            let stale = repo.get_stale_events(user.as_deref()).await?;
            if !stale.is_empty() {
                warn!(count = stale.len(), "pending events older than the stale threshold");
            }
        }
        Command::Retry { user, force, ids } => {
            let ids = if ids.is_empty() {
                repo.fetch_events(EventStatus::Failed, Some(&user), None)
                    .await?
                    .into_iter()
                    .map(|ev| ev.id)
                    .collect()
            } else {
                ids
            };
            let moved = if force {
                repo.requeue_exhausted(&ids).await?
            } else {
                repo.reset_for_retry(&ids).await?
            };
            println!("requeued {moved} of {} event(s)", ids.len());
        }
        Command::Purge { older_than_days } => {
            let deleted = match older_than_days {
                Some(days) => {
                    repo.delete_completed_events(Utc::now() - Duration::days(days))
                        .await?
                }
                None => repo.purge_expired().await?,
            };
            println!("deleted {deleted} completed event(s)");
        }
        Command::CheckSchema => {
            let stamped = plan.current_version(&pool).await?;
            match repo.compat().check_schema(plan.latest_version()).await? {
                SchemaStatus::Compatible => println!("compatible (version {stamped})"),
                SchemaStatus::MigrationNeeded { stamped, expected } => {
                    println!("migration needed: store at {stamped}, build expects {expected}")
                }
            }
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("refusing to reset without --yes");
            }
            db::reset_local_store(&pool)
                .await
                .context("failed to drop local tables")?;
            let report = plan.migrate(&pool).await?;
            info!(to = report.to, "local store reset");
            println!("local store reset to schema version {}", report.to);
        }
    }

    pool.close().await;
    Ok(())
}

fn print_event(ev: &OutboxEvent) {
    println!(
        "{}  {:<14} {:<24} attempts={} last_error={}",
        ev.id,
        ev.event_type.as_str(),
        ev.entity_id,
        ev.attempt_count,
        ev.error_message.as_deref().unwrap_or("-")
    );
}
