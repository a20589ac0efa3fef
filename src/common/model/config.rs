use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::chain::FilterType;
use crate::errors::{ConfigError, Result};

/// Stage identity and consumption settings
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StageConfig {
    /// Filter this deployment applies
    pub filter: FilterType,
    /// Messages handled concurrently (default: number of partitions)
    pub concurrency: usize,
    /// Publish a FAIL done event on conversion failure instead of waiting for redelivery
    pub surface_failures: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            filter: FilterType::Gray,
            concurrency: 2,
            surface_failures: false,
        }
    }
}

/// Kafka Configuration
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma separated bootstrap servers
    pub brokers: String,
    /// SASL PLAIN username
    pub username: Option<String>,
    /// SASL PLAIN password
    pub password: Option<String>,
    /// Enable TLS
    pub tls: Option<bool>,
    /// Consumer group; stages of the same filter share it
    pub group_id: Option<String>,
    pub session_timeout_ms: u64,
    /// Partitions for created topics
    pub partitions: i32,
    /// Replication factor for created topics
    pub replication: i32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            username: None,
            password: None,
            tls: None,
            group_id: None,
            session_timeout_ms: 6000,
            partitions: 2,
            replication: 1,
        }
    }
}

impl fmt::Debug for KafkaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaConfig")
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***REDACTED***"))
            .field("tls", &self.tls)
            .field("group_id", &self.group_id)
            .field("partitions", &self.partitions)
            .field("replication", &self.replication)
            .finish()
    }
}

/// Topic names
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TopicsConfig {
    /// Inbound chain topic (or prefix when `per_filter` is set)
    pub processing: String,
    /// Terminal events
    pub done: String,
    /// Route each filter type to `{processing}.{filter}`
    pub per_filter: bool,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            processing: "images.wip".to_string(),
            done: "images.done".to_string(),
            per_filter: true,
        }
    }
}

/// Redelivery policy applied by the consumption layer
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackoffConfig {
    pub interval_ms: u64,
    /// Redeliveries before the message is dead-lettered
    pub max_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_failures: 3,
        }
    }
}

/// Bounded retry of a single publish
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PublishConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_ms: 500,
        }
    }
}

/// Pixel processing settings
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FilterConfig {
    /// Regions at or below this pixel count are not split further
    pub split_threshold: usize,
    /// Worker threads for pixel work (0 = available parallelism)
    pub workers: usize,
    /// Gaussian sigma
    pub sigma: f64,
    /// Tags kept for the recognition caption
    pub tags_limit: usize,
    /// TrueType font for captions; system fonts are probed when unset
    pub font_path: Option<PathBuf>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            split_threshold: 10_000,
            workers: 0,
            sigma: 3.0,
            tags_limit: 3,
            font_path: None,
        }
    }
}

/// Recognition API and its resilience envelope
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Name reported by the circuit breaker
    pub target_service_name: String,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_wait_ms: u64,
    /// Percentage of failed calls that opens the breaker
    pub breaker_failure_rate_threshold: f32,
    pub breaker_sliding_window_size: usize,
    pub breaker_wait_in_open_ms: u64,
    pub breaker_half_open_calls: usize,
    pub rate_limiter_capacity: u64,
    pub rate_limiter_refill_tokens: u64,
    pub rate_limiter_refill_period_ms: u64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            target_service_name: "imagga".to_string(),
            base_url: "https://api.imagga.com/v2".to_string(),
            username: None,
            password: None,
            timeout_ms: 10_000,
            retry_max_attempts: 3,
            retry_wait_ms: 500,
            breaker_failure_rate_threshold: 50.0,
            breaker_sliding_window_size: 10,
            breaker_wait_in_open_ms: 10_000,
            breaker_half_open_calls: 3,
            rate_limiter_capacity: 10,
            rate_limiter_refill_tokens: 10,
            rate_limiter_refill_period_ms: 60_000,
        }
    }
}

impl fmt::Debug for IntegrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationConfig")
            .field("target_service_name", &self.target_service_name)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***REDACTED***"))
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("breaker_failure_rate_threshold", &self.breaker_failure_rate_threshold)
            .field("rate_limiter_capacity", &self.rate_limiter_capacity)
            .finish()
    }
}

/// Database Configuration
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,
    /// Connection pool size
    pub pool_size: Option<u32>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            pool_size: None,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"***REDACTED***")
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

/// Object store settings
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Tag marking intermediate artifacts
    pub temp_tag: String,
    /// Age after which temporary artifacts are purged
    pub temp_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/images"),
            temp_tag: "tmp".to_string(),
            temp_ttl_secs: 86_400,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggerSection {
    pub level: String,
    pub file_path: Option<PathBuf>,
    pub console: bool,
    pub json: bool,
}

impl Default for LoggerSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            console: true,
            json: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub stage: StageConfig,
    pub kafka: KafkaConfig,
    pub topics: TopicsConfig,
    pub backoff: BackoffConfig,
    pub publish: PublishConfig,
    pub filter: FilterConfig,
    pub integration: IntegrationConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub logger: LoggerSection,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config_str = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Read(e.into()))?;
        let config: Config = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage.concurrency == 0 {
            return Err(ConfigError::Invalid("stage.concurrency must be positive".into()).into());
        }
        if self.filter.split_threshold == 0 {
            return Err(ConfigError::Invalid("filter.split_threshold must be positive".into()).into());
        }
        if self.filter.sigma.is_nan() || self.filter.sigma <= 0.0 {
            return Err(ConfigError::Invalid("filter.sigma must be positive".into()).into());
        }
        if self.integration.retry_max_attempts == 0 {
            return Err(
                ConfigError::Invalid("integration.retry_max_attempts must be positive".into()).into(),
            );
        }
        if self.integration.breaker_sliding_window_size == 0 {
            return Err(ConfigError::Invalid(
                "integration.breaker_sliding_window_size must be positive".into(),
            )
            .into());
        }
        if self.publish.max_attempts == 0 {
            return Err(ConfigError::Invalid("publish.max_attempts must be positive".into()).into());
        }
        Ok(())
    }
}

impl BackoffConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl PublishConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
