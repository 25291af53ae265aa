use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use lume_sync::compat::SchemaStatus;
use lume_sync::config;
use lume_sync::credentials::{Credential, SingleFlightCredentials};
use lume_sync::db;
use lume_sync::error::RESET_LOCAL_DATA;
use lume_sync::migration::MigrationPlan;
use lume_sync::outbox::{ExecutorRegistry, OutboxProcessor, OutboxRepository};
use lume_sync::remote::{HttpSyncExecutor, RemoteTokenRefresher};

#[derive(Debug, Parser)]
#[command(author, version, about = "Drain the local outbox to the remote backend")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// User whose events are synced
    #[arg(long)]
    user: String,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    let plan = MigrationPlan::standard();
    let report = plan.migrate(&pool).await.context("schema migration failed")?;
    info!(from = report.from, to = report.to, "schema ready");

    let repo = Arc::new(
        OutboxRepository::new(pool.clone(), cfg.retry_policy())
            .with_scan_limit(cfg.outbox.fallback_scan_limit),
    );
    if let SchemaStatus::MigrationNeeded { stamped, expected } =
        repo.compat().check_schema(plan.latest_version()).await?
    {
        error!(stamped, expected, "store does not match this build");
        bail!("schema version {stamped} is incompatible with {expected}: {RESET_LOCAL_DATA}");
    }

    let base_url = Url::parse(&cfg.remote.base_url).context("invalid remote.base_url")?;
    let initial = cfg
        .remote
        .access_token
        .clone()
        .map(|token| Credential::new(token, cfg.remote.refresh_token.clone()))
        .or_else(|| {
            cfg.remote
                .refresh_token
                .clone()
                .map(|refresh| Credential::new("", Some(refresh)))
        });
    let credentials = Arc::new(SingleFlightCredentials::new(
        Arc::new(RemoteTokenRefresher::new(base_url.clone())?),
        initial,
    ));
    let executor = Arc::new(HttpSyncExecutor::new(base_url, credentials)?);
    let processor = OutboxProcessor::new(repo.clone(), ExecutorRegistry::new().with_fallback(executor))
        .with_batch_size(cfg.outbox.batch_size);

    match repo.purge_expired().await {
        Ok(purged) if purged > 0 => info!(purged, "purged expired completed events"),
        Ok(_) => {}
        Err(err) => error!(?err, "failed to purge expired events"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let poll = Duration::from_millis(cfg.app.poll_interval_ms);
    processor.run(&args.user, poll, shutdown_rx).await;
    pool.close().await;
    Ok(())
}
