use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use tg_curator::config;
use tg_curator::db;
use tg_curator::ingest::{self, IngestDeps, IngestError, PassLimits};
use tg_curator::relay::PubSubPublisher;
use tg_curator::source::HttpSourceClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Fetch new channel messages and publish them to the bus")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single pass even when `ingest.interval_secs` is set.
    #[arg(long)]
    once: bool,
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

    if cfg.source_api.base_url.trim().is_empty() {
        bail!("source_api.base_url must be set for ingest");
    }
    if cfg.pubsub.publish_url.trim().is_empty() {
        bail!("pubsub.publish_url must be set for ingest");
    }

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let base_url = Url::parse(&cfg.source_api.base_url).context("invalid source_api.base_url")?;
    let source = HttpSourceClient::new(base_url, cfg.source_api.token.clone())?;
    let publish_url = Url::parse(&cfg.pubsub.publish_url).context("invalid pubsub.publish_url")?;
    let publisher = PubSubPublisher::new(publish_url, cfg.pubsub.access_token.clone())?;

    let deps = IngestDeps {
        pool: &pool,
        source: &source,
        publisher: &publisher,
    };
    let limits = PassLimits::from(&cfg.ingest);
    let workspace_id = cfg.app.workspace_id.clone();

    if args.once || cfg.ingest.interval_secs == 0 {
        let report = ingest::run_pass(&deps, &workspace_id, &limits).await?;
        info!(?report, "single pass complete");
        return Ok(());
    }

    let interval = Duration::from_secs(cfg.ingest.interval_secs);
    info!(workspace_id = %workspace_id, ?interval, "starting periodic ingest");
    loop {
        match ingest::run_pass(&deps, &workspace_id, &limits).await {
            Ok(report) => info!(?report, "pass complete"),
            Err(IngestError::FloodAborted { source_id, attempts }) => {
                error!(%source_id, attempts, "pass aborted by flood limit")
            }
            Err(err) => error!(?err, "pass failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down ingest");
                return Ok(());
            }
        }
    }
}
