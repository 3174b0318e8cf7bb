//! # Queue System Configuration
//!
//! Every tunable of the queue, the processor loop, the retry scan, the shovel
//! and traffic shaping lives in [`QueueSystemConfig`]. Durations are stored as
//! `*_ms` integers so they read naturally in TOML and environment variables,
//! with [`Duration`] accessors for code.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use orca_queue::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//! println!("ack timeout: {:?}", config.queue.ack_timeout());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSystemConfig {
    pub environment: String,
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
    pub retry: RetryConfig,
    pub shovel: ShovelConfig,
    pub traffic_shaping: TrafficShapingConfig,
    pub tasks: TaskConfig,
    pub database: Option<DatabaseConfig>,
}

impl QueueSystemConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue.name.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "queue.name",
                &self.queue.name,
                "queue name must not be empty",
            ));
        }
        if self.queue.ack_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.ack_timeout_ms",
                0,
                "ack timeout must be positive",
            ));
        }
        if self.queue.max_retries == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.max_retries",
                0,
                "at least one redelivery is required",
            ));
        }
        if self.queue.max_attempts == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "queue.max_attempts",
                0,
                "omit the field instead of setting it to zero",
            ));
        }
        if self.processor.concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "processor.concurrency",
                0,
                "worker pool needs at least one slot",
            ));
        }
        if self.processor.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "processor.poll_interval_ms",
                0,
                "poll interval must be positive",
            ));
        }
        if self.retry.scan_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.scan_interval_ms",
                0,
                "retry scan interval must be positive",
            ));
        }
        if let Some(database) = &self.database {
            if database.url.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "database.url",
                    "",
                    "database url must be set when a database section is present",
                ));
            }
            if database.max_connections == 0 {
                return Err(ConfigurationError::invalid_value(
                    "database.max_connections",
                    0,
                    "pool needs at least one connection",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub ack_timeout_ms: u64,
    /// Unacknowledged redeliveries before a message is dead-lettered
    pub max_retries: u32,
    /// Optional cap on total deliveries, acked or not
    pub max_attempts: Option<u32>,
}

impl QueueConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "orca.task.queue".to_string(),
            ack_timeout_ms: 60_000,
            max_retries: 5,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub poll_interval_ms: u64,
    /// Worker pool size
    pub concurrency: usize,
    /// Poll for as many messages as there are free workers each cycle
    pub fill_executor_each_cycle: bool,
}

impl ProcessorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            concurrency: 20,
            fill_executor_each_cycle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub scan_interval_ms: u64,
    /// Delay before a handler re-checks a condition it is waiting on
    pub handler_retry_delay_ms: u64,
}

impl RetryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn handler_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handler_retry_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 10_000,
            handler_retry_delay_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ShovelConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl ShovelConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ShovelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrafficShapingConfig {
    pub poll_rate_limit: Option<PollRateLimitConfig>,
    pub application_rate_limit: Option<ApplicationRateLimitConfig>,
}

impl TrafficShapingConfig {
    pub fn is_enabled(&self) -> bool {
        self.poll_rate_limit.is_some() || self.application_rate_limit.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PollRateLimitConfig {
    pub max_polls: u32,
    pub window_ms: u64,
    #[serde(default)]
    pub priority: i32,
}

impl PollRateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApplicationRateLimitConfig {
    pub max_messages: u32,
    pub window_ms: u64,
    pub delay_ms: u64,
    #[serde(default)]
    pub priority: i32,
}

impl ApplicationRateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Task invocations slower than this are logged as warnings
    pub warning_threshold_ms: u64,
    /// Re-run delay for tasks that report RUNNING without a retry policy
    pub non_retryable_backoff_ms: u64,
}

impl TaskConfig {
    pub fn warning_threshold(&self) -> Duration {
        Duration::from_millis(self.warning_threshold_ms)
    }

    pub fn non_retryable_backoff(&self) -> Duration {
        Duration::from_millis(self.non_retryable_backoff_ms)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            warning_threshold_ms: 30_000,
            non_retryable_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "DatabaseConfig::default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "DatabaseConfig::default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "DatabaseConfig::default_table_prefix")]
    pub table_prefix: String,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: Self::default_max_connections(),
            acquire_timeout_ms: Self::default_acquire_timeout_ms(),
            table_prefix: Self::default_table_prefix(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    fn default_max_connections() -> u32 {
        10
    }

    fn default_acquire_timeout_ms() -> u64 {
        5_000
    }

    fn default_table_prefix() -> String {
        "orca_queue".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = QueueSystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.ack_timeout(), Duration::from_secs(60));
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.processor.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.retry.scan_interval(), Duration::from_secs(10));
        assert_eq!(config.shovel.interval(), Duration::from_millis(50));
        assert!(!config.traffic_shaping.is_enabled());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = QueueSystemConfig::default();
        config.processor.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { field, .. }) if field == "processor.concurrency"
        ));

        let mut config = QueueSystemConfig::default();
        config.queue.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = QueueSystemConfig::default();
        config.database = Some(DatabaseConfig::new(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: QueueSystemConfig =
            serde_json::from_value(serde_json::json!({"queue": {"max_retries": 3}})).unwrap();
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.ack_timeout_ms, 60_000);
        assert_eq!(config.processor.concurrency, 20);
    }
}
