//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from the CLAUDE_API_KEYS env var or api_keys_file and are
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use dispatch::RetryPolicy;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding comma-separated API keys
pub const API_KEYS_ENV: &str = "CLAUDE_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub claude: ClaudeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream Messages API settings
#[derive(Debug, Deserialize)]
pub struct ClaudeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_version")]
    pub version: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Path to a file with one API key per line (alternative to CLAUDE_API_KEYS)
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// Backoff applied when every credential is throttled
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Batch fan-out settings
#[derive(Debug, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_connections() -> usize {
    1000
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-3-5-sonnet-20240620".to_string()
}

fn default_api_version() -> String {
    claude_api::DEFAULT_API_VERSION.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    10
}

fn default_min_delay() -> u64 {
    10
}

fn default_max_delay() -> u64 {
    70
}

fn default_jitter() -> f64 {
    0.25
}

fn default_max_concurrency() -> usize {
    dispatch::batch::DEFAULT_MAX_CONCURRENCY
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            version: default_api_version(),
            timeout_secs: default_timeout(),
            api_keys_file: None,
            api_keys: Vec::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            min_delay: Duration::from_secs(self.min_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            jitter: self.jitter,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. CLAUDE_API_KEYS env var (comma-separated)
    /// 2. api_keys_file path from config (one key per line)
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.validate()?;

        // Resolve API keys: env var takes precedence over file
        if let Ok(keys) = std::env::var(API_KEYS_ENV) {
            config.claude.api_keys = split_keys(&keys, ',');
        } else if let Some(ref keys_file) = config.claude.api_keys_file {
            let keys = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            config.claude.api_keys = split_keys(&keys, '\n');
        }

        if config.claude.api_keys.is_empty() {
            return Err(common::Error::Config(format!(
                "no API keys configured: set {API_KEYS_ENV} or claude.api_keys_file"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        // Validate base_url is a valid URL with http(s) scheme
        if !self.claude.base_url.starts_with("http://")
            && !self.claude.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.claude.base_url
            )));
        }

        if self.claude.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.retry.min_delay_secs > self.retry.max_delay_secs {
            return Err(common::Error::Config(format!(
                "min_delay_secs ({}) must not exceed max_delay_secs ({})",
                self.retry.min_delay_secs, self.retry.max_delay_secs
            )));
        }

        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(common::Error::Config(format!(
                "jitter must be in [0, 1), got: {}",
                self.retry.jitter
            )));
        }

        if self.batch.max_concurrency == 0 {
            return Err(common::Error::Config(
                "max_concurrency must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("bq-claude-remote-function.toml")
    }
}

fn split_keys(raw: &str, separator: char) -> Vec<Secret<String>> {
    raw.split(separator)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| Secret::new(key.to_string()))
        .collect()
}
