//! Transform chain: ordered mappers turning one normalized event into zero
//! or more time-series points.
//!
//! Each rule handles one event source and returns an empty vector for the
//! others, so the standard chain can stay fixed while events of every kind
//! flow through it. A failing transform dead-letters the event with reason
//! `transform:<name>`.
//!
//! Tag discipline: only `domain`, `entity_id` and `source` become tags;
//! these are bounded by the installation size. Everything free-form goes
//! into fields.

use serde::{Deserialize, Serialize};

use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{EventSource, NormalizedEvent};
use ha_ingest_core::point::{FieldValue, Point};

/// One event-to-points mapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransformRule {
    /// State changes → one `entity_state` point: the state string, its
    /// numeric reading when it parses, and numeric attributes as fields.
    StateToPoint,
    /// Weather enrichment → one `weather` point.
    WeatherToPoint,
    /// Power correlation enrichment → one `power_correlation` point.
    PowerToPoint,
}

impl TransformRule {
    pub fn name(&self) -> &'static str {
        match self {
            TransformRule::StateToPoint => "state_to_point",
            TransformRule::WeatherToPoint => "weather_to_point",
            TransformRule::PowerToPoint => "power_to_point",
        }
    }

    pub fn apply(&self, event: &NormalizedEvent) -> IngestResult<Vec<Point>> {
        match self {
            TransformRule::StateToPoint => self.state_to_point(event),
            TransformRule::WeatherToPoint => self.enrichment_to_point(
                event,
                EventSource::Weather,
                "weather",
                &["temperature", "humidity", "pressure", "wind_speed", "cloud_coverage"],
            ),
            TransformRule::PowerToPoint => self.enrichment_to_point(
                event,
                EventSource::PowerCorrelation,
                "power_correlation",
                &[
                    "total_power_w",
                    "active_lights",
                    "active_switches",
                    "watts_per_active_device",
                ],
            ),
        }
    }

    fn state_to_point(&self, event: &NormalizedEvent) -> IngestResult<Vec<Point>> {
        if event.source != EventSource::StateChange {
            return Ok(Vec::new());
        }
        let Some(state) = event.new_state.as_deref() else {
            // Entity removal; nothing measurable.
            return Ok(Vec::new());
        };

        let mut point = Point::new("entity_state", event.source_timestamp)
            .tag("domain", event.domain.clone())
            .tag("entity_id", event.entity_id.clone())
            .tag("source", event.source.as_str())
            .field("state", state)
            .field("correlation_id", event.correlation_id.clone());

        if let Ok(value) = state.parse::<f64>() {
            if value.is_finite() {
                point = point.field("value", value);
            }
        }
        if let Some(previous) = event.previous_state.as_deref() {
            point = point.field("previous_state", previous);
        }
        for (key, value) in &event.attributes {
            if let Some(field) = numeric_field(value) {
                point = point.field(attribute_field_key(key), field);
            }
        }
        Ok(vec![point])
    }

    fn enrichment_to_point(
        &self,
        event: &NormalizedEvent,
        source: EventSource,
        measurement: &str,
        numeric_keys: &[&str],
    ) -> IngestResult<Vec<Point>> {
        if event.source != source {
            return Ok(Vec::new());
        }

        let mut point = Point::new(measurement, event.source_timestamp)
            .tag("entity_id", event.entity_id.clone())
            .tag("source", event.source.as_str())
            .field("correlation_id", event.correlation_id.clone());

        for key in numeric_keys {
            match event.attributes.get(*key) {
                Some(value) => match numeric_field(value) {
                    Some(field) => point = point.field(*key, field),
                    None => {
                        return Err(IngestError::transform(
                            self.name(),
                            format!("attribute {} is not numeric", key),
                        ))
                    }
                },
                None => continue,
            }
        }
        if let Some(state) = event.new_state.as_deref() {
            point = point.field("condition", state);
        }

        if !point.has_fields() {
            return Err(IngestError::transform(
                self.name(),
                "enrichment event produced no fields",
            ));
        }
        Ok(vec![point])
    }
}

/// Numeric JSON values become numeric fields; booleans become boolean
/// fields; everything else is skipped.
fn numeric_field(value: &serde_json::Value) -> Option<FieldValue> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Integer(i))
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(FieldValue::Float)
            }
        }
        serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        _ => None,
    }
}

/// Attribute keys share the field namespace with the fixed fields; prefix
/// them so `state`/`value` can never be shadowed.
fn attribute_field_key(key: &str) -> String {
    format!("attr_{}", key)
}

/// Ordered transform chain.
#[derive(Debug, Clone)]
pub struct TransformChain {
    rules: Vec<TransformRule>,
}

impl TransformChain {
    pub fn new(rules: Vec<TransformRule>) -> Self {
        TransformChain { rules }
    }

    /// The chain every deployment runs: state changes plus both enrichment
    /// kinds.
    pub fn standard() -> Self {
        TransformChain {
            rules: vec![
                TransformRule::StateToPoint,
                TransformRule::WeatherToPoint,
                TransformRule::PowerToPoint,
            ],
        }
    }

    /// Apply every rule in order, collecting all produced points. The first
    /// failing rule aborts the event.
    pub fn apply(&self, event: &NormalizedEvent) -> IngestResult<Vec<Point>> {
        let mut points = Vec::new();
        for rule in &self.rules {
            points.extend(rule.apply(event)?);
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state_event(entity_id: &str, state: &str, attrs: serde_json::Value) -> NormalizedEvent {
        let now = Utc::now();
        NormalizedEvent {
            event_type: "state_changed".to_string(),
            entity_id: entity_id.to_string(),
            domain: NormalizedEvent::domain_of(entity_id).to_string(),
            previous_state: Some("off".to_string()),
            new_state: Some(state.to_string()),
            attributes: attrs.as_object().cloned().unwrap_or_default(),
            source_timestamp: now,
            receipt_timestamp: now,
            correlation_id: NormalizedEvent::correlation_id_for(entity_id, now),
            source: EventSource::StateChange,
        }
    }

    #[test]
    fn state_change_produces_one_point_with_numeric_value() {
        let event = state_event(
            "sensor.outdoor_temp",
            "21.5",
            serde_json::json!({"battery": 88, "friendly_name": "Outdoor"}),
        );
        let points = TransformChain::standard().apply(&event).unwrap();
        assert_eq!(points.len(), 1);
        let point = &points[0];
        assert_eq!(point.measurement, "entity_state");
        assert_eq!(point.tags["domain"], "sensor");
        assert_eq!(point.fields["value"], FieldValue::Float(21.5));
        assert_eq!(point.fields["attr_battery"], FieldValue::Integer(88));
        // Free-form attribute stays out of the fields.
        assert!(!point.fields.contains_key("attr_friendly_name"));
    }

    #[test]
    fn non_numeric_state_still_produces_a_point() {
        let event = state_event("light.kitchen", "on", serde_json::json!({"brightness": 128}));
        let points = TransformChain::standard().apply(&event).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].fields["state"], FieldValue::Text("on".to_string()));
        assert!(!points[0].fields.contains_key("value"));
        assert_eq!(points[0].fields["attr_brightness"], FieldValue::Integer(128));
    }

    #[test]
    fn removed_entity_produces_no_points() {
        let mut event = state_event("light.gone", "on", serde_json::json!({}));
        event.new_state = None;
        let points = TransformChain::standard().apply(&event).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn weather_event_maps_to_weather_measurement() {
        let mut attrs = serde_json::Map::new();
        attrs.insert("temperature".to_string(), serde_json::json!(18.2));
        attrs.insert("humidity".to_string(), serde_json::json!(64));
        let event = NormalizedEvent::enrichment(
            EventSource::Weather,
            "weather.current",
            Utc::now(),
            attrs,
            Some("Clouds".to_string()),
        );
        let points = TransformChain::standard().apply(&event).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "weather");
        assert_eq!(points[0].fields["temperature"], FieldValue::Float(18.2));
        assert_eq!(
            points[0].fields["condition"],
            FieldValue::Text("Clouds".to_string())
        );
    }

    #[test]
    fn weather_event_with_non_numeric_reading_fails_with_transform_reason() {
        let mut attrs = serde_json::Map::new();
        attrs.insert("temperature".to_string(), serde_json::json!("warm"));
        let event = NormalizedEvent::enrichment(
            EventSource::Weather,
            "weather.current",
            Utc::now(),
            attrs,
            None,
        );
        let err = TransformChain::standard().apply(&event).unwrap_err();
        assert_eq!(err.reason_label(), "transform:weather_to_point");
    }

    #[test]
    fn points_keep_enqueue_order_across_rules() {
        // One state change: exactly the state rule fires; enrichment rules
        // contribute nothing but must not error.
        let event = state_event("switch.heater", "off", serde_json::json!({}));
        let points = TransformChain::standard().apply(&event).unwrap();
        assert_eq!(points.len(), 1);
    }
}
