use crate::store::StoreType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Progress event throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressThrottleConfig {
    /// Minimum interval between emissions (ms).
    pub interval_ms: u64,
    /// Minimum byte delta between emissions.
    pub threshold_bytes: u64,
}

impl Default for ProgressThrottleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            threshold_bytes: 1024 * 1024, // 1MB
        }
    }
}

/// Retry behavior for network errors and HTTP 5xx.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the `retry_count`-th retry (1-based): exponential backoff.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_factor.powi(retry_count.saturating_sub(1).min(16) as i32);
        Duration::from_millis((self.initial_delay_ms as f64 * factor) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub download_dir: PathBuf,
    /// Scheduler slot count.
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub store: StoreType,
    pub progress_throttle: ProgressThrottleConfig,
    pub debug: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            concurrency: 2,
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            store: StoreType::Sqlite("downloads.db".into()),
            progress_throttle: ProgressThrottleConfig::default(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfigBuilder {
    inner: DownloadConfig,
}

impl Default for DownloadConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self {
            inner: DownloadConfig::default(),
        }
    }

    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner.download_dir = dir.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.inner.concurrency = n;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.inner.retry = retry;
        self
    }

    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.inner.connect_timeout = Duration::from_secs(secs);
        self
    }

    pub fn request_timeout(mut self, secs: u64) -> Self {
        self.inner.request_timeout = Duration::from_secs(secs);
        self
    }

    pub fn store(mut self, store: StoreType) -> Self {
        self.inner.store = store;
        self
    }

    pub fn progress_throttle(mut self, cfg: ProgressThrottleConfig) -> Self {
        self.inner.progress_throttle = cfg;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.inner.debug = debug;
        self
    }

    pub fn build(self) -> Result<DownloadConfig, DownloadConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[derive(Debug, Error)]
pub enum DownloadConfigError {
    #[error("Invalid download directory: {0}")]
    InvalidDownloadDir(String),
    #[error("Invalid concurrency: {0}")]
    InvalidConcurrency(usize),
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), DownloadConfigError> {
        if !self.download_dir.to_str().is_some_and(|s| !s.is_empty()) {
            return Err(DownloadConfigError::InvalidDownloadDir(
                self.download_dir.to_string_lossy().to_string(),
            ));
        }

        if let Err(e) = std::fs::create_dir_all(&self.download_dir) {
            return Err(DownloadConfigError::InvalidDownloadDir(format!(
                "Cannot create directory '{}': {}",
                self.download_dir.display(),
                e
            )));
        }

        if self.concurrency == 0 || self.concurrency > 100 {
            return Err(DownloadConfigError::InvalidConcurrency(self.concurrency));
        }

        Ok(())
    }

    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

impl FromStr for DownloadConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}
