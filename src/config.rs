//! Configuration loader and validator for the thumbnail pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
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
    pub queue: Queue,
    pub openai: OpenAi,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_stuck_after")]
    pub stuck_after_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

/// Retry accounting for thumbnail jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub max_attempts: i32,
    pub base_backoff_seconds: i64,
    pub max_backoff_seconds: i64,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_seconds: 5,
            max_backoff_seconds: 60,
        }
    }
}

/// Image generation API settings.
///
/// `api_key` may be absent: the generator then fails each attempt fast
/// instead of refusing to start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenAi {
    #[serde(default)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,
}

fn default_workers() -> usize {
    2
}

fn default_stuck_after() -> u64 {
    900
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_read_timeout() -> u64 {
    300
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }

    pub fn blob_dir(&self) -> PathBuf {
        Path::new(&self.resolved_data_dir()).join("blobs")
    }

    /// Scratch space for images materialized during a generation attempt.
    pub fn scratch_dir(&self) -> PathBuf {
        Path::new(&self.resolved_data_dir()).join("tmp")
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}/sketches.db", self.resolved_data_dir())
    }
}

impl OpenAi {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// True when a non-blank API key is present.
    pub fn has_credential(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }
}

impl Config {
    /// Ensure required directories exist (data, blob and scratch dirs).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())?;
        fs::create_dir_all(self.app.blob_dir())?;
        fs::create_dir_all(self.app.scratch_dir())
    }

    /// Job lease: a claimed job becomes claimable again after this long.
    pub fn job_lease(&self) -> Duration {
        self.openai.connect_timeout() + self.openai.read_timeout() + Duration::from_secs(60)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.openai.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("OPENAI_API_BASE_URL") {
            if !url.trim().is_empty() {
                self.openai.base_url = url;
            }
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            if !model.trim().is_empty() {
                self.openai.model = model;
            }
        }
    }
}

/// Load configuration from a YAML file, apply env overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.stuck_after_seconds == 0 {
        return Err(ConfigError::Invalid("app.stuck_after_seconds must be > 0"));
    }

    if cfg.queue.max_attempts < 1 {
        return Err(ConfigError::Invalid("queue.max_attempts must be >= 1"));
    }
    if cfg.queue.base_backoff_seconds < 0 {
        return Err(ConfigError::Invalid("queue.base_backoff_seconds must be >= 0"));
    }

    if !is_http_url(&cfg.openai.base_url) {
        return Err(ConfigError::Invalid(
            "openai.base_url must be an http(s) URL",
        ));
    }
    if cfg.openai.model.trim().is_empty() {
        return Err(ConfigError::Invalid("openai.model must be non-empty"));
    }
    if cfg.openai.prompt.trim().is_empty() {
        return Err(ConfigError::Invalid("openai.prompt must be non-empty"));
    }
    if cfg.openai.connect_timeout_seconds == 0 || cfg.openai.connect_timeout_seconds > 60 {
        return Err(ConfigError::Invalid(
            "openai.connect_timeout_seconds must be within 1..=60",
        ));
    }
    if cfg.openai.read_timeout_seconds == 0 || cfg.openai.read_timeout_seconds > 300 {
        return Err(ConfigError::Invalid(
            "openai.read_timeout_seconds must be within 1..=300",
        ));
    }

    Ok(())
}

fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("http://") || url.starts_with("https://")
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  workers: 2
  stuck_after_seconds: 900
  sweep_interval_seconds: 60

queue:
  max_attempts: 3
  base_backoff_seconds: 5
  max_backoff_seconds: 60

openai:
  # Leave empty and set OPENAI_API_KEY instead to keep the key out of the file.
  api_key: ""
  base_url: "https://api.openai.com"
  model: "gpt-image-1"
  prompt: "Turn this rough sketch into a polished, eye-catching video thumbnail. Keep the composition, use bold colors, clean shapes and strong contrast."
  connect_timeout_seconds: 60
  read_timeout_seconds: 300
"#
}
