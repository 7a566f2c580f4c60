//! Environment variable loading with type conversion and defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{ConfigError, ConfigResult};

/// Environment variable loader used by every configuration section.
pub struct EnvLoader;

impl EnvLoader {
    /// Load a required environment variable.
    pub fn load_required<T>(key: &str) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = env::var(key).map_err(|_| ConfigError::env_var_not_found(key))?;
        value
            .parse()
            .map_err(|e| ConfigError::parse_error(key, format!("{}", e)))
    }

    /// Load an optional environment variable, falling back to a default.
    pub fn load_with_default<T>(key: &str, default: T) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(key) {
            Ok(value) => value
                .parse()
                .map_err(|e| ConfigError::parse_error(key, format!("{}", e))),
            Err(_) => Ok(default),
        }
    }

    /// Load an optional environment variable.
    pub fn load_optional<T>(key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(key) {
            Ok(value) => value
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::parse_error(key, format!("{}", e))),
            Err(_) => Ok(None),
        }
    }

    /// Load a boolean accepting the usual string variations.
    pub fn load_bool(key: &str, default: bool) -> bool {
        match env::var(key).as_deref() {
            Ok("true" | "True" | "TRUE" | "1" | "yes" | "Yes" | "YES" | "on" | "On" | "ON") => true,
            Ok("false" | "False" | "FALSE" | "0" | "no" | "No" | "NO" | "off" | "Off" | "OFF") => {
                false
            }
            _ => default,
        }
    }

    /// Load a duration expressed in whole seconds.
    pub fn load_duration_secs(key: &str, default_secs: u64) -> ConfigResult<Duration> {
        let secs: u64 = Self::load_with_default(key, default_secs)?;
        Ok(Duration::from_secs(secs))
    }

    /// Load a duration expressed in milliseconds.
    pub fn load_duration_millis(key: &str, default_millis: u64) -> ConfigResult<Duration> {
        let millis: u64 = Self::load_with_default(key, default_millis)?;
        Ok(Duration::from_millis(millis))
    }

    /// Load a comma-separated list, empty when unset.
    pub fn load_list(key: &str) -> Vec<String> {
        match env::var(key) {
            Ok(value) if !value.trim().is_empty() => value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}
