//! Daemon configuration (`wardend.toml`).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;
const DEFAULT_RETAIN: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bot API token issued by BotFather.
    pub bot_token: String,
    /// Numeric Telegram id of the single trusted operator.
    pub operator_id: i64,
    /// Root for all runtime state (offset, confirmations, tasks, releases, journal, lock).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Long-poll timeout passed to getUpdates.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    /// Upper bound on concurrently running queued tasks.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Key for the journal HMAC chain. Falls back to the bot token.
    #[serde(default)]
    pub journal_key: Option<String>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

/// One deployable project, keyed by name under `[projects.<name>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub git_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub build_cmd: Option<String>,
    #[serde(default)]
    pub restart_cmd: Option<String>,
    /// How many releases to keep on disk after a deploy.
    #[serde(default = "default_retain")]
    pub retain: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wardend")
}

fn default_poll_timeout() -> u64 {
    DEFAULT_POLL_TIMEOUT_SECS
}

fn default_max_concurrent_tasks() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_retain() -> usize {
    DEFAULT_RETAIN
}

impl Config {
    pub fn journal_key(&self) -> &[u8] {
        self.journal_key
            .as_deref()
            .unwrap_or(self.bot_token.as_str())
            .as_bytes()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config '{}'", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config '{}'", path.display()))?;
    if config.bot_token.trim().is_empty() {
        anyhow::bail!("bot_token must not be empty in '{}'", path.display());
    }
    Ok(config)
}

/// Resolution order: --config flag, WARDEND_CONFIG env, ./wardend.toml.
pub fn resolve_config_path(flag: Option<PathBuf>) -> Option<PathBuf> {
    flag.or_else(|| std::env::var("WARDEND_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join("wardend.toml");
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        })
}
