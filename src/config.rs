//! Configuration loader and validator shared by the ingest, processor and
//! approver services.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub workspace: Option<WorkspaceSeed>,
    #[serde(default)]
    pub ingest: Ingest,
    #[serde(default)]
    pub source_api: SourceApi,
    #[serde(default)]
    pub pubsub: PubSub,
    #[serde(default)]
    pub processor: Processor,
    #[serde(default)]
    pub approver: Approver,
    pub telegram: Telegram,
    #[serde(default)]
    pub editor: Editor,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
    pub workspace_id: String,
    #[serde(default = "default_workspace_refresh_secs")]
    pub workspace_refresh_secs: u64,
}

/// Provisioning data consumed by the `workspace_init` tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceSeed {
    pub title: String,
    pub group_chat_id: i64,
    #[serde(default)]
    pub ingest_thread_id: Option<i32>,
    #[serde(default)]
    pub review_thread_id: Option<i32>,
    #[serde(default)]
    pub publish_channel: Option<String>,
    #[serde(default)]
    pub gpt_profile: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Limits and retry policy for one ingestion pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ingest {
    pub per_source_limit: u32,
    pub total_limit: u32,
    pub flood_max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 0 runs a single pass and exits.
    pub interval_secs: u64,
}

impl Default for Ingest {
    fn default() -> Self {
        Self {
            per_source_limit: 50,
            total_limit: 200,
            flood_max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceApi {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PubSub {
    /// Full `…/topics/<topic>:publish` endpoint.
    #[serde(default)]
    pub publish_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// When set, push requests must carry a bearer token for this audience.
    #[serde(default)]
    pub verification_audience: Option<String>,
    #[serde(default)]
    pub token_info_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Processor {
    pub listen: String,
    #[serde(default)]
    pub approver_notify_url: Option<String>,
    pub notify_timeout_secs: u64,
}

impl Default for Processor {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8081".into(),
            approver_notify_url: None,
            notify_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Approver {
    pub listen: String,
    pub claim_ttl_secs: u64,
    /// 0 disables the periodic reconcile task.
    pub reconcile_interval_secs: u64,
}

impl Default for Approver {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8082".into(),
            claim_ttl_secs: 120,
            reconcile_interval_secs: 0,
        }
    }
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// Language-model editor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Editor {
    #[serde(default)]
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Named system prompts; workspaces select one via `gpt_profile`.
    #[serde(default)]
    pub profiles: BTreeMap<String, String>,
}

impl Default for Editor {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/".into(),
            model: "gpt-4o-mini".into(),
            timeout_secs: 60,
            profiles: BTreeMap::new(),
        }
    }
}

fn default_workspace_refresh_secs() -> u64 {
    300
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }

    /// `DATABASE_URL` wins over the configured URL, which wins over the
    /// default file inside `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/curator.db", self.resolved_data_dir()))
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("TG_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram.bot_token = token;
            }
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.editor.api_key = key;
            }
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance. Service-specific requirements (a
/// source API for ingest, a publish URL, …) are checked by the binary that
/// needs them.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.workspace_id.trim().is_empty() {
        return Err(ConfigError::Invalid("app.workspace_id must be non-empty"));
    }

    if cfg.ingest.per_source_limit == 0 {
        return Err(ConfigError::Invalid("ingest.per_source_limit must be > 0"));
    }
    if cfg.ingest.total_limit < cfg.ingest.per_source_limit {
        return Err(ConfigError::Invalid(
            "ingest.total_limit must be >= ingest.per_source_limit",
        ));
    }
    if cfg.ingest.backoff_base_ms == 0 || cfg.ingest.backoff_max_ms < cfg.ingest.backoff_base_ms {
        return Err(ConfigError::Invalid(
            "ingest.backoff_max_ms must be >= ingest.backoff_base_ms > 0",
        ));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if let Some(secret) = &cfg.telegram.webhook_secret {
        if secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "telegram.webhook_secret must be non-empty when set",
            ));
        }
    }

    if cfg.approver.claim_ttl_secs == 0 {
        return Err(ConfigError::Invalid("approver.claim_ttl_secs must be > 0"));
    }
    if cfg.editor.timeout_secs == 0 {
        return Err(ConfigError::Invalid("editor.timeout_secs must be > 0"));
    }
    // A redact holds its claim across the editor call.
    if cfg.approver.claim_ttl_secs <= cfg.editor.timeout_secs {
        return Err(ConfigError::Invalid(
            "approver.claim_ttl_secs must be greater than editor.timeout_secs",
        ));
    }
    if cfg.editor.model.trim().is_empty() {
        return Err(ConfigError::Invalid("editor.model must be non-empty"));
    }

    if let Some(ws) = &cfg.workspace {
        if ws.title.trim().is_empty() {
            return Err(ConfigError::Invalid("workspace.title must be non-empty"));
        }
    }

    Ok(())
}

/// Returns a documented example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  workspace_id: "finance-ua"
  workspace_refresh_secs: 300

workspace:
  title: "Finance UA"
  group_chat_id: -1001234567890
  ingest_thread_id: 2
  review_thread_id: 3
  publish_channel: "@finance_digest"
  gpt_profile: "default"
  sources:
    - "@nbu_ua"
    - "Minfin_com_ua"
    - "tax_gov_ua"

ingest:
  per_source_limit: 50
  total_limit: 200
  flood_max_retries: 3
  backoff_base_ms: 2000
  backoff_max_ms: 60000
  interval_secs: 0

source_api:
  base_url: "http://127.0.0.1:8090/"

pubsub:
  publish_url: "https://pubsub.googleapis.com/v1/projects/PROJECT/topics/tg-raw-ingested:publish"
  verification_audience: "https://processor.example.run.app/pubsub/push"

processor:
  listen: "0.0.0.0:8081"
  approver_notify_url: "http://127.0.0.1:8082/internal/notify"
  notify_timeout_secs: 10

approver:
  listen: "0.0.0.0:8082"
  claim_ttl_secs: 120
  reconcile_interval_secs: 600

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  webhook_secret: "YOUR_WEBHOOK_SECRET"

editor:
  base_url: "https://api.openai.com/"
  model: "gpt-4o-mini"
  timeout_secs: 60
  profiles:
    short: "Rewrite the post in two sentences, neutral tone."
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.ingest.per_source_limit, 50);
        assert_eq!(cfg.ingest.total_limit, 200);
        assert_eq!(cfg.workspace.as_ref().unwrap().sources.len(), 3);
        assert!(cfg.editor.profiles.contains_key("short"));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let yaml = r#"
app:
  data_dir: "./data"
  workspace_id: "ws"
telegram:
  bot_token: "t"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.ingest, Ingest::default());
        assert_eq!(cfg.app.workspace_refresh_secs, 300);
        assert_eq!(cfg.approver.claim_ttl_secs, 120);
        assert!(cfg.pubsub.verification_audience.is_none());
        assert!(cfg.workspace.is_none());
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg = example_cfg();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_workspace_id() {
        let mut cfg = example_cfg();
        cfg.app.workspace_id = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("workspace_id")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_ingest_limits() {
        let mut cfg = example_cfg();
        cfg.ingest.per_source_limit = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.ingest.total_limit = 10;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.ingest.backoff_max_ms = 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn claim_ttl_must_outlast_editor_timeout() {
        let mut cfg = example_cfg();
        cfg.approver.claim_ttl_secs = cfg.editor.timeout_secs;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("claim_ttl_secs")),
            _ => panic!("wrong error"),
        }
        cfg.approver.claim_ttl_secs = cfg.editor.timeout_secs + 1;
        validate(&cfg).unwrap();
    }

    #[test]
    fn empty_webhook_secret_rejected() {
        let mut cfg = example_cfg();
        cfg.telegram.webhook_secret = Some("".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.workspace_id, "finance-ua");
        assert_eq!(
            cfg.workspace.unwrap().publish_channel.as_deref(),
            Some("@finance_digest")
        );
    }
}
