//! Weather enrichment worker.
//!
//! Polls an OpenWeatherMap-compatible current-conditions endpoint and emits
//! one `weather.current` event per fetch with the numeric readings the
//! transform chain turns into a `weather` point.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use ha_ingest_core::config::WeatherConfig;
use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{EventSource, NormalizedEvent};

use super::EnrichmentWorker;

pub struct WeatherWorker {
    config: WeatherConfig,
    http: reqwest::Client,
}

impl WeatherWorker {
    pub fn new(config: WeatherConfig) -> IngestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| {
                IngestError::configuration(format!("failed to build weather client: {}", e))
            })?;
        Ok(WeatherWorker { config, http })
    }
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmWind {
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmClouds {
    all: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmCondition {
    main: String,
}

#[derive(Debug, Deserialize)]
struct OwmResponse {
    #[serde(default)]
    weather: Vec<OwmCondition>,
    main: Option<OwmMain>,
    wind: Option<OwmWind>,
    clouds: Option<OwmClouds>,
}

#[async_trait]
impl EnrichmentWorker for WeatherWorker {
    fn kind(&self) -> &'static str {
        "weather"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    fn cache_ttl(&self) -> Duration {
        self.config.cache_ttl
    }

    fn fetch_timeout(&self) -> Duration {
        self.config.fetch_timeout
    }

    async fn fetch(&self) -> IngestResult<Vec<NormalizedEvent>> {
        let url = format!(
            "{}?lat={}&lon={}&appid={}&units=metric",
            self.config.base_url, self.config.latitude, self.config.longitude, self.config.api_key
        );

        let response = self.http.get(&url).send().await.map_err(|e| {
            IngestError::transient_network(&self.config.base_url, format!("fetch failed: {}", e))
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(IngestError::authentication(
                &self.config.base_url,
                format!("weather API rejected the key: {}", status),
            ));
        }
        if !status.is_success() {
            return Err(IngestError::transient_network(
                &self.config.base_url,
                format!("weather API returned {}", status),
            ));
        }

        let body: OwmResponse = response.json().await.map_err(|e| {
            IngestError::protocol(format!("weather payload undecodable: {}", e))
        })?;

        let fetched_at = Utc::now();
        let mut attributes = serde_json::Map::new();
        if let Some(main) = &body.main {
            if let Some(temp) = main.temp {
                attributes.insert("temperature".to_string(), serde_json::json!(temp));
            }
            if let Some(humidity) = main.humidity {
                attributes.insert("humidity".to_string(), serde_json::json!(humidity));
            }
            if let Some(pressure) = main.pressure {
                attributes.insert("pressure".to_string(), serde_json::json!(pressure));
            }
        }
        if let Some(speed) = body.wind.as_ref().and_then(|w| w.speed) {
            attributes.insert("wind_speed".to_string(), serde_json::json!(speed));
        }
        if let Some(coverage) = body.clouds.as_ref().and_then(|c| c.all) {
            attributes.insert("cloud_coverage".to_string(), serde_json::json!(coverage));
        }
        let condition = body.weather.first().map(|c| c.main.clone());

        Ok(vec![NormalizedEvent::enrichment(
            EventSource::Weather,
            "weather.current",
            fetched_at,
            attributes,
            condition,
        )])
    }
}
