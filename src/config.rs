//! Configuration loader and validator for the digest pipeline.
use serde::{Deserialize, Serialize};
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

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub sources: Vec<Source>,
    pub listing: Listing,
    pub transcripts: Transcripts,
    pub summarizer: SummarizerCfg,
    pub digest: Digest,
    pub queue: Queue,
    pub retry: Retry,
    pub cleanup: Cleanup,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub look_back_hours: i64,
    pub ttl_days: i64,
    pub invocation_timeout_secs: i64,
}

/// One watched content source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub label: String,
}

/// External listing API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listing {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Transcript endpoint settings. Proxy credentials are optional; leaving
/// them unset is a valid (if fragile) deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transcripts {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_username: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
}

/// Summarization provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummarizerCfg {
    pub api_key: String,
    pub model: String,
    pub language: String,
    pub max_input_chars: usize,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Digest compilation and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub window_days: i64,
    pub sender: String,
    pub recipient: String,
    pub endpoint: String,
    pub api_key: String,
}

/// Work queue tuning. The visibility timeout must exceed a processor
/// invocation's wall-clock budget by a safety margin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub visibility_timeout_secs: i64,
    pub max_deliveries: i64,
    pub nack_base_secs: i64,
    pub nack_cap_secs: i64,
}

/// Content-unavailable retry policy. The cadence is an operational knob,
/// not a structural constant: intervals_days[i] is the wait after the
/// (i+1)th failed attempt, and the last entry repeats if attempts outrun
/// the ladder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    pub max_retries: i64,
    pub intervals_days: Vec<i64>,
}

/// Retention cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cleanup {
    pub age_days: i64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Wait before the retry following the given number of consumed
    /// attempts, in days.
    pub fn retry_interval_days(&self, attempts_so_far: i64) -> i64 {
        let ladder = &self.retry.intervals_days;
        let idx = (attempts_so_far.max(0) as usize).min(ladder.len().saturating_sub(1));
        ladder[idx]
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.look_back_hours <= 0 {
        return Err(ConfigError::Invalid("app.look_back_hours must be > 0"));
    }
    if cfg.app.ttl_days <= 0 {
        return Err(ConfigError::Invalid("app.ttl_days must be > 0"));
    }
    if cfg.app.invocation_timeout_secs <= 0 {
        return Err(ConfigError::Invalid("app.invocation_timeout_secs must be > 0"));
    }

    if cfg.sources.is_empty() {
        return Err(ConfigError::Invalid("sources must list at least one source"));
    }
    for source in &cfg.sources {
        if source.id.trim().is_empty() {
            return Err(ConfigError::Invalid("sources[].id must be non-empty"));
        }
        if source.label.trim().is_empty() {
            return Err(ConfigError::Invalid("sources[].label must be non-empty"));
        }
    }

    if cfg.listing.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("listing.api_key must be non-empty"));
    }

    if cfg.summarizer.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("summarizer.api_key must be non-empty"));
    }
    if cfg.summarizer.model.trim().is_empty() {
        return Err(ConfigError::Invalid("summarizer.model must be non-empty"));
    }
    if cfg.summarizer.language.trim().is_empty() {
        return Err(ConfigError::Invalid("summarizer.language must be non-empty"));
    }
    if cfg.summarizer.max_input_chars == 0 {
        return Err(ConfigError::Invalid("summarizer.max_input_chars must be > 0"));
    }

    if cfg.digest.window_days <= 0 {
        return Err(ConfigError::Invalid("digest.window_days must be > 0"));
    }
    if cfg.digest.sender.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.sender must be non-empty"));
    }
    if cfg.digest.recipient.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.recipient must be non-empty"));
    }
    if cfg.digest.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.endpoint must be non-empty"));
    }
    if cfg.digest.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.api_key must be non-empty"));
    }

    if cfg.queue.visibility_timeout_secs <= 0 {
        return Err(ConfigError::Invalid("queue.visibility_timeout_secs must be > 0"));
    }
    if cfg.queue.max_deliveries <= 0 {
        return Err(ConfigError::Invalid("queue.max_deliveries must be > 0"));
    }
    if cfg.queue.nack_base_secs <= 0 {
        return Err(ConfigError::Invalid("queue.nack_base_secs must be > 0"));
    }
    if cfg.queue.nack_cap_secs < cfg.queue.nack_base_secs {
        return Err(ConfigError::Invalid(
            "queue.nack_cap_secs must be >= queue.nack_base_secs",
        ));
    }
    // A lease that can expire while its processor is still alive would
    // cause premature redelivery of in-flight work.
    if cfg.queue.visibility_timeout_secs <= cfg.app.invocation_timeout_secs {
        return Err(ConfigError::Invalid(
            "queue.visibility_timeout_secs must exceed app.invocation_timeout_secs",
        ));
    }

    if cfg.retry.max_retries < 0 {
        return Err(ConfigError::Invalid("retry.max_retries must be >= 0"));
    }
    if cfg.retry.intervals_days.is_empty() {
        return Err(ConfigError::Invalid("retry.intervals_days must be non-empty"));
    }
    if cfg.retry.intervals_days.iter().any(|d| *d <= 0) {
        return Err(ConfigError::Invalid("retry.intervals_days entries must be > 0"));
    }

    if cfg.cleanup.age_days <= 0 {
        return Err(ConfigError::Invalid("cleanup.age_days must be > 0"));
    }

    Ok(())
}

/// Canonical example configuration, used by tests and as documentation.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  look_back_hours: 24
  ttl_days: 30
  invocation_timeout_secs: 600

sources:
  - id: "UCabc123"
    label: "Example Channel"

listing:
  api_key: "YOUR_LISTING_API_KEY"

transcripts:
  proxy_username: "proxy-user"
  proxy_password: "proxy-pass"

summarizer:
  api_key: "YOUR_PROVIDER_API_KEY"
  model: "claude-3-5-haiku-20241022"
  language: "English"
  max_input_chars: 30000

digest:
  window_days: 7
  sender: "digest@example.com"
  recipient: "reader@example.com"
  endpoint: "https://mail.example.com/v1/send"
  api_key: "YOUR_MAIL_API_KEY"

queue:
  visibility_timeout_secs: 900
  max_deliveries: 5
  nack_base_secs: 5
  nack_cap_secs: 3600

retry:
  max_retries: 3
  intervals_days: [2, 2, 2]

cleanup:
  age_days: 30
"#
}
