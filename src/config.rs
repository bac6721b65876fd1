use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{FanoutError, Result};

/// How the monitor waits between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Sleep the full poll interval
    #[default]
    Polling,
    /// Wake early on store change notifications
    Notify,
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Delay between monitor ticks
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Monitor deadline measured from the start of the watch
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
    /// Sled database path, `None` for an in-memory store
    pub store_path: Option<PathBuf>,
    /// Prefix for generated worker ids
    pub worker_prefix: String,
    /// Run a shared pool of this many workers instead of one per subtask
    pub pool_workers: Option<usize>,
    pub wait_strategy: WaitMode,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(120),
            store_path: None,
            worker_prefix: "worker".to_string(),
            pool_workers: None,
            wait_strategy: WaitMode::Polling,
        }
    }
}

impl FanoutConfig {
    pub fn builder() -> FanoutConfigBuilder {
        FanoutConfigBuilder::new()
    }

    /// Short timings for tests and demos
    pub fn development() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_wait: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(FanoutError::configuration("poll_interval must be greater than 0"));
        }
        if self.max_wait < self.poll_interval {
            return Err(FanoutError::configuration(
                "max_wait cannot be shorter than poll_interval",
            ));
        }
        if self.worker_prefix.trim().is_empty() {
            return Err(FanoutError::configuration("worker_prefix must not be empty"));
        }
        if self.pool_workers == Some(0) {
            return Err(FanoutError::configuration("pool_workers must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for FanoutConfig
pub struct FanoutConfigBuilder {
    config: FanoutConfig,
}

impl FanoutConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FanoutConfig::default(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.config.max_wait = max_wait;
        self
    }

    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = Some(path.into());
        self
    }

    pub fn worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.worker_prefix = prefix.into();
        self
    }

    pub fn pool_workers(mut self, workers: usize) -> Self {
        self.config.pool_workers = Some(workers);
        self
    }

    pub fn wait_strategy(mut self, mode: WaitMode) -> Self {
        self.config.wait_strategy = mode;
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<FanoutConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for FanoutConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
