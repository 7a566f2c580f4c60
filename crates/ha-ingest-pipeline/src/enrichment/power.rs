//! Power correlation enrichment worker.
//!
//! Takes a REST snapshot of entity states from the source instance and
//! correlates the power-class sensor readings with the number of active
//! switchable devices, emitting one `power.correlation` event per fetch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use ha_ingest_core::config::PowerConfig;
use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{EventSource, NormalizedEvent};

use super::EnrichmentWorker;

pub struct PowerCorrelationWorker {
    config: PowerConfig,
    http: reqwest::Client,
    states_url: String,
}

impl PowerCorrelationWorker {
    pub fn new(config: PowerConfig) -> IngestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| {
                IngestError::configuration(format!("failed to build power client: {}", e))
            })?;
        let states_url = format!("{}/api/states", rest_base(&config.ha_url));
        Ok(PowerCorrelationWorker {
            config,
            http,
            states_url,
        })
    }
}

/// The REST API lives on the plain HTTP scheme even when the stream URL was
/// configured as ws(s).
fn rest_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct StateEntry {
    entity_id: String,
    state: String,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

impl StateEntry {
    fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }

    fn is_power_sensor(&self) -> bool {
        let device_class = self
            .attributes
            .get("device_class")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let unit = self
            .attributes
            .get("unit_of_measurement")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        self.domain() == "sensor" && (device_class == "power" || unit == "W")
    }

    fn reading(&self) -> Option<f64> {
        self.state.parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

#[async_trait]
impl EnrichmentWorker for PowerCorrelationWorker {
    fn kind(&self) -> &'static str {
        "power_correlation"
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
        let response = self
            .http
            .get(&self.states_url)
            .header("Authorization", format!("Bearer {}", self.config.ha_token))
            .send()
            .await
            .map_err(|e| {
                IngestError::transient_network(&self.states_url, format!("fetch failed: {}", e))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(IngestError::authentication(
                &self.states_url,
                format!("states endpoint rejected the token: {}", status),
            ));
        }
        if !status.is_success() {
            return Err(IngestError::transient_network(
                &self.states_url,
                format!("states endpoint returned {}", status),
            ));
        }

        let states: Vec<StateEntry> = response.json().await.map_err(|e| {
            IngestError::protocol(format!("states payload undecodable: {}", e))
        })?;

        let total_power_w: f64 = states
            .iter()
            .filter(|s| s.is_power_sensor())
            .filter_map(StateEntry::reading)
            .sum();
        let active_lights = states
            .iter()
            .filter(|s| s.domain() == "light" && s.state == "on")
            .count() as i64;
        let active_switches = states
            .iter()
            .filter(|s| s.domain() == "switch" && s.state == "on")
            .count() as i64;
        let active = active_lights + active_switches;

        let mut attributes = serde_json::Map::new();
        attributes.insert("total_power_w".to_string(), serde_json::json!(total_power_w));
        attributes.insert("active_lights".to_string(), serde_json::json!(active_lights));
        attributes.insert(
            "active_switches".to_string(),
            serde_json::json!(active_switches),
        );
        if active > 0 {
            attributes.insert(
                "watts_per_active_device".to_string(),
                serde_json::json!(total_power_w / active as f64),
            );
        }

        Ok(vec![NormalizedEvent::enrichment(
            EventSource::PowerCorrelation,
            "power.correlation",
            Utc::now(),
            attributes,
            None,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(ha_url: String) -> PowerConfig {
        PowerConfig {
            ha_url,
            ha_token: "token".to_string(),
            interval: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn rest_base_converts_ws_schemes() {
        assert_eq!(rest_base("ws://ha.local:8123"), "http://ha.local:8123");
        assert_eq!(rest_base("wss://ha.example.com/"), "https://ha.example.com");
        assert_eq!(rest_base("http://ha.local:8123"), "http://ha.local:8123");
    }

    #[tokio::test]
    async fn correlates_power_with_active_devices() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states"))
            .and(header("Authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"entity_id": "sensor.plug_power", "state": "120.5",
                 "attributes": {"device_class": "power", "unit_of_measurement": "W"}},
                {"entity_id": "sensor.heater_power", "state": "79.5",
                 "attributes": {"unit_of_measurement": "W"}},
                {"entity_id": "sensor.broken_power", "state": "unavailable",
                 "attributes": {"device_class": "power"}},
                {"entity_id": "light.kitchen", "state": "on", "attributes": {}},
                {"entity_id": "light.hall", "state": "off", "attributes": {}},
                {"entity_id": "switch.heater", "state": "on", "attributes": {}},
                {"entity_id": "sensor.outdoor_temp", "state": "21.5",
                 "attributes": {"unit_of_measurement": "°C"}}
            ])))
            .mount(&server)
            .await;

        let worker = PowerCorrelationWorker::new(config(server.uri())).unwrap();
        let events = worker.fetch().await.unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.entity_id, "power.correlation");
        assert_eq!(event.source, EventSource::PowerCorrelation);
        assert_eq!(event.attributes["total_power_w"], 200.0);
        assert_eq!(event.attributes["active_lights"], 1);
        assert_eq!(event.attributes["active_switches"], 1);
        assert_eq!(event.attributes["watts_per_active_device"], 100.0);
    }

    #[tokio::test]
    async fn rejected_token_is_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let worker = PowerCorrelationWorker::new(config(server.uri())).unwrap();
        let err = worker.fetch().await.unwrap_err();
        assert!(matches!(err, IngestError::Authentication { .. }));
    }
}
