//! Configuration Loader
//!
//! Layers, lowest precedence first:
//!
//! 1. built-in defaults ([`QueueSystemConfig::default`])
//! 2. `<dir>/orca-queue.toml`, when present
//! 3. `<dir>/orca-queue.<environment>.toml`, when present
//! 4. `ORCA_QUEUE_*` environment variables, `__` separating nested keys
//!    (`ORCA_QUEUE_QUEUE__MAX_RETRIES=3`)

use super::error::{ConfigResult, ConfigurationError};
use super::QueueSystemConfig;
use crate::logging::get_environment;
use config::{Config, Environment, File};
use std::path::PathBuf;
use tracing::{debug, info};

const ENV_PREFIX: &str = "ORCA_QUEUE";

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_directory: PathBuf,
    environment: String,
    read_env_vars: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        let config_directory = std::env::var("ORCA_QUEUE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"));
        Self {
            config_directory,
            environment: get_environment(),
            read_env_vars: true,
        }
    }

    pub fn with_config_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config_directory = directory.into();
        self
    }

    /// Override the detected environment; useful for tests
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Skip the environment variable layer
    pub fn without_env_vars(mut self) -> Self {
        self.read_env_vars = false;
        self
    }

    pub fn load(&self) -> ConfigResult<QueueSystemConfig> {
        let base = self.config_directory.join("orca-queue.toml");
        let overlay = self
            .config_directory
            .join(format!("orca-queue.{}.toml", self.environment));

        debug!(
            base = %base.display(),
            overlay = %overlay.display(),
            environment = %self.environment,
            "Loading queue configuration"
        );

        let defaults = Config::try_from(&QueueSystemConfig::default())
            .map_err(ConfigurationError::invalid_structure)?;

        let mut builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(base).required(false))
            .add_source(File::from(overlay).required(false));
        if self.read_env_vars {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: QueueSystemConfig = builder
            .build()?
            .try_deserialize()
            .map_err(ConfigurationError::invalid_structure)?;
        if config.environment.is_empty() {
            config.environment = self.environment.clone();
        }
        config.validate()?;

        info!(
            environment = %config.environment,
            queue = %config.queue.name,
            concurrency = config.processor.concurrency,
            postgres = config.database.is_some(),
            "🔧 Queue configuration loaded"
        );
        Ok(config)
    }
}
