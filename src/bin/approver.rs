use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tg_curator::approver::{self, ApproverState};
use tg_curator::config;
use tg_curator::db;
use tg_curator::drafts::DraftMachine;
use tg_curator::editor::{OpenAiEditor, Profiles};
use tg_curator::moderator::TelegramModerator;
use tg_curator::workspace::WorkspaceCache;

const RECONCILE_BATCH: i64 = 50;

#[derive(Debug, Parser)]
#[command(author, version, about = "Moderator bot webhook and draft lifecycle")]
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

    if cfg.editor.api_key.trim().is_empty() {
        warn!("editor.api_key is empty; redact requests will fail and skip drafts");
    }
    let editor = OpenAiEditor::from_config(&cfg.editor)?;
    let machine = DraftMachine::new(
        pool,
        Arc::new(TelegramModerator::new(&cfg.telegram.bot_token)),
        Arc::new(editor),
        Profiles::new(&cfg.editor.profiles),
        Duration::from_secs(cfg.approver.claim_ttl_secs),
        Duration::from_secs(cfg.editor.timeout_secs),
    );
    let state = Arc::new(ApproverState {
        machine,
        workspaces: Arc::new(WorkspaceCache::new(Duration::from_secs(
            cfg.app.workspace_refresh_secs,
        ))),
        default_workspace: cfg.app.workspace_id.clone(),
        webhook_secret: cfg.telegram.webhook_secret.clone(),
        reconcile_limit: RECONCILE_BATCH,
    });

    if cfg.approver.reconcile_interval_secs > 0 {
        let every = Duration::from_secs(cfg.approver.reconcile_interval_secs);
        info!(?every, "periodic reconcile enabled");
        approver::spawn_reconciler(state.clone(), every);
    }

    let listener = tokio::net::TcpListener::bind(&cfg.approver.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.approver.listen))?;
    info!(listen = %cfg.approver.listen, "approver listening");
    axum::serve(listener, approver::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
