use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub page_size: u32,
    pub poll_interval_ms: u64,
    pub poll_retry_interval_ms: u64,
    /// Applies to status, list and page requests. The run stream has no deadline.
    pub request_timeout_ms: u64,
    pub cache_entries: u64,
    pub db_path: PathBuf,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval_ms: 3000,
            poll_retry_interval_ms: 5000,
            request_timeout_ms: 30_000,
            cache_entries: 64,
            db_path: PathBuf::from(".vantage/session.db"),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Reads a YAML config file. Unknown keys are reported, not rejected.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;

        let mut ignored = Vec::new();
        let deserializer = serde_yaml::Deserializer::from_str(&raw);
        let cfg: ClientConfig = serde_ignored::deserialize(deserializer, |p| {
            ignored.push(p.to_string());
        })
        .with_context(|| format!("failed to parse YAML in {}", path.display()))?;

        if !ignored.is_empty() {
            tracing::warn!(
                event = "vantage.config.unknown_keys",
                path = %path.display(),
                keys = ?ignored,
                "ignored unknown config keys"
            );
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("VANTAGE_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = env::var("VANTAGE_PAGE_SIZE") {
            if let Ok(n) = v.parse() {
                self.page_size = n;
            }
        }
        if let Ok(v) = env::var("VANTAGE_POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.poll_interval_ms = n;
            }
        }
        if let Ok(v) = env::var("VANTAGE_POLL_RETRY_MS") {
            if let Ok(n) = v.parse() {
                self.poll_retry_interval_ms = n;
            }
        }
        if let Ok(v) = env::var("VANTAGE_CACHE_ENTRIES") {
            if let Ok(n) = v.parse() {
                self.cache_entries = n;
            }
        }
        if let Ok(v) = env::var("VANTAGE_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("VANTAGE_LOG") {
            self.log_level = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_url.trim().is_empty() {
            anyhow::bail!("config: base_url must not be empty");
        }
        if self.page_size == 0 {
            anyhow::bail!("config: page_size must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_retry_interval(&self) -> Duration {
        Duration::from_millis(self.poll_retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
