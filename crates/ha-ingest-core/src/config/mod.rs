//! Process configuration assembled from environment variable bindings.
//!
//! One [`IngestConfig`] is loaded at startup by the supervisor and handed to
//! each component at construction. Missing or malformed required values fail
//! fast with a [`ConfigError`]; every optional knob carries the default fixed
//! by the pipeline contract.

pub mod env_utils;
mod error;

pub use env_utils::EnvLoader;
pub use error::{ConfigError, ConfigResult};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration object owned by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub ha: HaConfig,
    pub tsdb: TsdbConfig,
    pub metadata: MetadataConfig,
    pub router: RouterConfig,
    pub enrichment: EnrichmentConfig,
    pub supervisor: SupervisorConfig,
}

/// Home Assistant source connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// Base URL of the Home Assistant instance (`http(s)://` or `ws(s)://`).
    pub url: String,
    /// Long-lived access token.
    pub token: String,
    /// Base delay of the reconnect backoff schedule.
    pub reconnect_delay: Duration,
    /// Timeout for the initial connect + auth handshake.
    pub connection_timeout: Duration,
    /// Link is treated as broken when no frame arrives for this long.
    pub heartbeat_timeout: Duration,
}

/// Time-series store write settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsdbConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// Size-based flush trigger.
    pub batch_size: usize,
    /// Age-based flush trigger.
    pub flush_interval: Duration,
    /// Per-flush request deadline.
    pub write_timeout: Duration,
    /// Bounded retry buffer capacity, in batches.
    pub retry_buffer_batches: usize,
}

/// Embedded metadata store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub db_path: String,
    /// Upserts arriving within this window are committed in one transaction.
    pub coalesce_window: Duration,
}

/// Event router and intake queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub intake_capacity: usize,
    pub workers: usize,
    /// When non-empty, only these domains pass the filter chain.
    pub domain_allow: Vec<String>,
    pub domain_deny: Vec<String>,
    pub entity_deny: Vec<String>,
    /// Drop events whose new state is `unavailable`/`unknown`.
    pub drop_unavailable: bool,
}

/// Periodic enrichment worker settings; a worker left unconfigured is not
/// started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub weather: Option<WeatherConfig>,
    pub power: Option<PowerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub api_key: String,
    pub latitude: f64,
    pub longitude: f64,
    pub base_url: String,
    pub interval: Duration,
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    /// REST states endpoint base; shares the source instance credentials.
    pub ha_url: String,
    pub ha_token: String,
    pub interval: Duration,
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
}

/// Lifecycle and health surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub shutdown_deadline: Duration,
    pub health_port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Text,
    Json,
}

impl IngestConfig {
    /// Assemble the configuration from the process environment and validate
    /// it. The recognized variables are listed in the repository README.
    pub fn from_env() -> ConfigResult<Self> {
        let ha = HaConfig {
            url: EnvLoader::load_required("HA_URL")?,
            token: EnvLoader::load_required("HA_TOKEN")?,
            reconnect_delay: EnvLoader::load_duration_secs("HA_RECONNECT_DELAY", 1)?,
            connection_timeout: EnvLoader::load_duration_secs("HA_CONNECTION_TIMEOUT", 30)?,
            heartbeat_timeout: EnvLoader::load_duration_secs("HA_HEARTBEAT_TIMEOUT", 60)?,
        };

        let tsdb = TsdbConfig {
            url: EnvLoader::load_required("TSDB_URL")?,
            token: EnvLoader::load_required("TSDB_TOKEN")?,
            org: EnvLoader::load_required("TSDB_ORG")?,
            bucket: EnvLoader::load_required("TSDB_BUCKET")?,
            batch_size: EnvLoader::load_with_default("TSDB_BATCH_SIZE", 1000usize)?,
            flush_interval: EnvLoader::load_duration_secs("TSDB_FLUSH_INTERVAL", 5)?,
            write_timeout: EnvLoader::load_duration_secs("TSDB_WRITE_TIMEOUT", 5)?,
            retry_buffer_batches: EnvLoader::load_with_default(
                "TSDB_RETRY_BUFFER_BATCHES",
                100usize,
            )?,
        };

        let metadata = MetadataConfig {
            db_path: EnvLoader::load_with_default(
                "META_DB_PATH",
                "./data/metadata.db".to_string(),
            )?,
            coalesce_window: EnvLoader::load_duration_millis("META_COALESCE_WINDOW_MS", 1000)?,
        };

        let router = RouterConfig {
            intake_capacity: EnvLoader::load_with_default("INTAKE_QUEUE_CAPACITY", 10_000usize)?,
            workers: EnvLoader::load_with_default("ROUTER_WORKERS", 4usize)?,
            domain_allow: EnvLoader::load_list("ROUTER_DOMAIN_ALLOW"),
            domain_deny: EnvLoader::load_list("ROUTER_DOMAIN_DENY"),
            entity_deny: EnvLoader::load_list("ROUTER_ENTITY_DENY"),
            drop_unavailable: EnvLoader::load_bool("ROUTER_DROP_UNAVAILABLE", true),
        };

        let fetch_timeout = EnvLoader::load_duration_secs("ENRICHMENT_FETCH_TIMEOUT", 10)?;

        let weather = match EnvLoader::load_optional::<String>("ENRICHMENT_WEATHER_API_KEY")? {
            Some(api_key) => Some(WeatherConfig {
                api_key,
                latitude: EnvLoader::load_required("ENRICHMENT_WEATHER_LATITUDE")?,
                longitude: EnvLoader::load_required("ENRICHMENT_WEATHER_LONGITUDE")?,
                base_url: EnvLoader::load_with_default(
                    "ENRICHMENT_WEATHER_URL",
                    "https://api.openweathermap.org/data/2.5/weather".to_string(),
                )?,
                interval: EnvLoader::load_duration_secs("ENRICHMENT_WEATHER_INTERVAL", 300)?,
                cache_ttl: EnvLoader::load_duration_secs("ENRICHMENT_WEATHER_CACHE_TTL", 240)?,
                fetch_timeout,
            }),
            None => None,
        };

        let power = if EnvLoader::load_bool("ENRICHMENT_POWER_ENABLED", true) {
            Some(PowerConfig {
                ha_url: ha.url.clone(),
                ha_token: ha.token.clone(),
                interval: EnvLoader::load_duration_secs("ENRICHMENT_POWER_INTERVAL", 60)?,
                cache_ttl: EnvLoader::load_duration_secs("ENRICHMENT_POWER_CACHE_TTL", 30)?,
                fetch_timeout,
            })
        } else {
            None
        };

        let supervisor = SupervisorConfig {
            shutdown_deadline: EnvLoader::load_duration_secs("SHUTDOWN_DEADLINE_SECONDS", 30)?,
            health_port: EnvLoader::load_with_default("HEALTH_PORT", 8099u16)?,
            log_format: match EnvLoader::load_with_default(
                "LOG_FORMAT",
                "text".to_string(),
            )?
            .as_str()
            {
                "json" | "JSON" => LogFormat::Json,
                _ => LogFormat::Text,
            },
        };

        let config = IngestConfig {
            ha,
            tsdb,
            metadata,
            router,
            enrichment: EnrichmentConfig { weather, power },
            supervisor,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation run after assembly.
    pub fn validate(&self) -> ConfigResult<()> {
        for (key, url) in [("HA_URL", &self.ha.url), ("TSDB_URL", &self.tsdb.url)] {
            let ok = ["http://", "https://", "ws://", "wss://"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !ok {
                return Err(ConfigError::invalid_value(
                    key,
                    url.as_str(),
                    "an http(s) or ws(s) URL",
                ));
            }
        }
        if self.ha.token.trim().is_empty() {
            return Err(ConfigError::invalid_value("HA_TOKEN", "", "a non-empty token"));
        }
        if self.tsdb.batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "TSDB_BATCH_SIZE",
                "0",
                "a positive batch size",
            ));
        }
        if self.tsdb.flush_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "TSDB_FLUSH_INTERVAL",
                "0",
                "a positive number of seconds",
            ));
        }
        if self.router.intake_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "INTAKE_QUEUE_CAPACITY",
                "0",
                "a positive capacity",
            ));
        }
        if self.router.workers == 0 {
            return Err(ConfigError::invalid_value(
                "ROUTER_WORKERS",
                "0",
                "at least one worker",
            ));
        }
        if let Some(weather) = &self.enrichment.weather {
            if !(-90.0..=90.0).contains(&weather.latitude)
                || !(-180.0..=180.0).contains(&weather.longitude)
            {
                return Err(ConfigError::validation_failed(
                    "ENRICHMENT_WEATHER_LATITUDE/LONGITUDE outside valid range",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> IngestConfig {
        IngestConfig {
            ha: HaConfig {
                url: "ws://homeassistant.local:8123".to_string(),
                token: "token".to_string(),
                reconnect_delay: Duration::from_secs(1),
                connection_timeout: Duration::from_secs(30),
                heartbeat_timeout: Duration::from_secs(60),
            },
            tsdb: TsdbConfig {
                url: "http://influx:8086".to_string(),
                token: "token".to_string(),
                org: "home".to_string(),
                bucket: "telemetry".to_string(),
                batch_size: 1000,
                flush_interval: Duration::from_secs(5),
                write_timeout: Duration::from_secs(5),
                retry_buffer_batches: 100,
            },
            metadata: MetadataConfig {
                db_path: "./data/metadata.db".to_string(),
                coalesce_window: Duration::from_millis(1000),
            },
            router: RouterConfig {
                intake_capacity: 10_000,
                workers: 4,
                domain_allow: Vec::new(),
                domain_deny: Vec::new(),
                entity_deny: Vec::new(),
                drop_unavailable: true,
            },
            enrichment: EnrichmentConfig::default(),
            supervisor: SupervisorConfig {
                shutdown_deadline: Duration::from_secs(30),
                health_port: 8099,
                log_format: LogFormat::Text,
            },
        }
    }

    #[test]
    fn minimal_config_validates() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = minimal_config();
        config.tsdb.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_url_source() {
        let mut config = minimal_config();
        config.ha.url = "homeassistant.local".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("HA_URL"));
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = minimal_config();
        config.router.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        let mut config = minimal_config();
        config.enrichment.weather = Some(WeatherConfig {
            api_key: "key".to_string(),
            latitude: 123.0,
            longitude: 0.0,
            base_url: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            interval: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(240),
            fetch_timeout: Duration::from_secs(10),
        });
        assert!(config.validate().is_err());
    }
}
