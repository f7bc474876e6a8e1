use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_cache_extension")]
    pub cache_extension: String,

    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_minutes: u64,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_minutes: i64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_hours: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    pub claude_api_key: Option<String>,
}

fn data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("read-stash");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir
}

fn default_db_path() -> String {
    data_dir().join("articles.db").to_string_lossy().to_string()
}

fn default_cache_dir() -> PathBuf {
    data_dir().join("content")
}

fn default_cache_extension() -> String {
    "html".to_string()
}

fn default_cache_max_age_days() -> u64 {
    30
}

fn default_retry_interval() -> u64 {
    5
}

fn default_retry_delay() -> i64 {
    10
}

fn default_max_attempts() -> i64 {
    3
}

fn default_cleanup_interval() -> u64 {
    24
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_user_agent() -> String {
    concat!("read-stash/", env!("CARGO_PKG_VERSION"), " (+article-extractor)").to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_dir: default_cache_dir(),
            cache_extension: default_cache_extension(),
            cache_max_age_days: default_cache_max_age_days(),
            retry_interval_minutes: default_retry_interval(),
            retry_delay_minutes: default_retry_delay(),
            max_attempts: default_max_attempts(),
            cleanup_interval_hours: default_cleanup_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_redirects: default_max_redirects(),
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
            worker_concurrency: default_worker_concurrency(),
            claude_api_key: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, writing the defaults there on first run.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("read-stash")
            .join("config.toml")
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(AppError::Config("max_attempts must be at least 1".into()));
        }
        if self.retry_interval_minutes == 0 || self.cleanup_interval_hours == 0 {
            return Err(AppError::Config("sweep and cleanup intervals must be non-zero".into()));
        }
        if self.worker_concurrency == 0 {
            return Err(AppError::Config("worker_concurrency must be at least 1".into()));
        }
        if self.cache_extension.is_empty() || self.cache_extension.contains(['.', '/']) {
            return Err(AppError::Config(format!(
                "cache_extension {:?} must be a bare extension like \"html\"",
                self.cache_extension
            )));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 60 * 60)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_days * 24 * 60 * 60)
    }
}
