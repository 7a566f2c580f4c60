//! Configuration error types.

use crate::error::IngestError;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while assembling the process configuration from the
/// environment. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {key} is not set")]
    EnvVarNotFound { key: String },

    #[error("failed to parse {key}: {message}")]
    ParseError { key: String, message: String },

    #[error("invalid value for {key}: got {value:?}, expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn env_var_not_found(key: impl Into<String>) -> Self {
        ConfigError::EnvVarNotFound { key: key.into() }
    }

    pub fn parse_error(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn invalid_value(
        key: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        ConfigError::ValidationFailed {
            message: message.into(),
        }
    }
}

impl From<ConfigError> for IngestError {
    fn from(err: ConfigError) -> Self {
        IngestError::Configuration {
            message: err.to_string(),
        }
    }
}
