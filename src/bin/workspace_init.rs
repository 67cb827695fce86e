use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use teloxide::prelude::*;
use tracing::info;

use tg_curator::config;
use tg_curator::db;
use tg_curator::workspace;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Provision the workspace and its sources from the `workspace` config section"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Reset cursors of existing sources so they bootstrap again.
    #[arg(long)]
    reset_cursors: bool,

    /// Only report the stored workspace and source state.
    #[arg(long)]
    check: bool,

    /// Register the approver webhook URL with the Bot API.
    #[arg(long, value_name = "URL")]
    set_webhook: Option<String>,
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
    let workspace_id = cfg.app.workspace_id.as_str();

    if !args.check {
        let Some(seed) = &cfg.workspace else {
            bail!("config has no `workspace` section to provision");
        };
        workspace::provision(&pool, workspace_id, seed, args.reset_cursors).await?;
    }

    let Some(ws) = db::get_workspace(&pool, workspace_id).await? else {
        bail!("workspace {} not found", workspace_id);
    };
    let sources = db::list_sources(&pool, workspace_id, false).await?;
    if sources.is_empty() {
        bail!("workspace {} has no sources configured", workspace_id);
    }
    info!(
        workspace_id,
        title = %ws.title,
        publish_channel = ?ws.publish_channel,
        drafts = db::count_drafts(&pool, workspace_id).await?,
        published = db::count_published(&pool, workspace_id).await?,
        "workspace state"
    );
    for src in &sources {
        info!(
            source_id = %src.id,
            tg_entity = %src.tg_entity,
            enabled = src.enabled,
            last_message_id = src.last_message_id,
            bootstrapped = src.bootstrapped,
            "source state"
        );
    }

    if let Some(url) = args.set_webhook {
        let url = reqwest::Url::parse(&url).context("invalid webhook URL")?;
        let bot = Bot::new(cfg.telegram.bot_token.clone());
        let mut req = bot.set_webhook(url.clone());
        if let Some(secret) = &cfg.telegram.webhook_secret {
            req = req.secret_token(secret.clone());
        }
        req.await.context("setWebhook failed")?;
        info!(%url, "webhook registered");
    }
    Ok(())
}
