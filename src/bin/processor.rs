use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tg_curator::auth::TokenInfoVerifier;
use tg_curator::config;
use tg_curator::db;
use tg_curator::notify::{HttpNotifier, NoopNotifier, Notifier};
use tg_curator::processor::{self, ProcessorState};
use tg_curator::workspace::WorkspaceCache;

#[derive(Debug, Parser)]
#[command(author, version, about = "Turn bus deliveries into drafts")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let notifier: Arc<dyn Notifier> = match cfg.processor.approver_notify_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            let url = Url::parse(url).context("invalid processor.approver_notify_url")?;
            Arc::new(HttpNotifier::new(
                url,
                Duration::from_secs(cfg.processor.notify_timeout_secs),
            )?)
        }
        _ => {
            info!("approver notify URL not configured; drafts wait for reconcile");
            Arc::new(NoopNotifier)
        }
    };
    let verifier = TokenInfoVerifier::new(cfg.pubsub.token_info_url.as_deref())?;

    let state = ProcessorState {
        pool,
        workspaces: Arc::new(WorkspaceCache::new(Duration::from_secs(
            cfg.app.workspace_refresh_secs,
        ))),
        default_workspace: cfg.app.workspace_id.clone(),
        verifier: Arc::new(verifier),
        audience: cfg.pubsub.verification_audience.clone(),
        notifier,
    };

    let listener = tokio::net::TcpListener::bind(&cfg.processor.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.processor.listen))?;
    info!(listen = %cfg.processor.listen, "processor listening");
    axum::serve(listener, processor::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
