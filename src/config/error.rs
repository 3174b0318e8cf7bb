//! Configuration Error Types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A layer could not be read or merged
    #[error("Failed to load configuration: {error}")]
    LoadError { error: String },

    /// Merged layers did not deserialize into the expected shape
    #[error("Invalid configuration structure: {error}")]
    InvalidStructure { error: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

impl ConfigurationError {
    pub fn load_error(error: impl ToString) -> Self {
        Self::LoadError {
            error: error.to_string(),
        }
    }

    pub fn invalid_structure(error: impl ToString) -> Self {
        Self::InvalidStructure {
            error: error.to_string(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        context: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::load_error(err)
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
