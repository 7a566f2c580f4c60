//! Normalization of raw source frames into canonical events and registry
//! records.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{
    DeviceRecord, EntityRecord, EventSource, NormalizedEvent, RawEvent,
};

/// `old_state` / `new_state` object inside a state_changed payload.
#[derive(Debug, Clone, Deserialize)]
struct StateObject {
    state: String,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StateChangedData {
    entity_id: String,
    old_state: Option<StateObject>,
    new_state: Option<StateObject>,
}

#[derive(Debug, Deserialize)]
struct StateChangedPayload {
    data: StateChangedData,
    time_fired: Option<DateTime<Utc>>,
}

/// Turn a `state_changed` frame into the canonical record. The source
/// timestamp is the frame's `time_fired`, falling back to receipt time when
/// the source omitted it.
pub fn normalize_state_changed(raw: &RawEvent) -> IngestResult<NormalizedEvent> {
    let payload: StateChangedPayload = serde_json::from_value(raw.payload.clone())
        .map_err(|e| IngestError::protocol(format!("state_changed payload: {}", e)))?;

    let entity_id = payload.data.entity_id;
    if entity_id.is_empty() {
        return Err(IngestError::protocol("state_changed without entity_id"));
    }

    let source_timestamp = payload.time_fired.unwrap_or(raw.received_wall);
    let attributes = payload
        .data
        .new_state
        .as_ref()
        .map(|s| s.attributes.clone())
        .unwrap_or_default();

    Ok(NormalizedEvent {
        event_type: raw.kind.clone(),
        domain: NormalizedEvent::domain_of(&entity_id).to_string(),
        correlation_id: NormalizedEvent::correlation_id_for(&entity_id, source_timestamp),
        previous_state: payload.data.old_state.map(|s| s.state),
        new_state: payload.data.new_state.map(|s| s.state),
        attributes,
        source_timestamp,
        receipt_timestamp: raw.received_wall,
        entity_id,
        source: EventSource::StateChange,
    })
}

#[derive(Debug, Deserialize)]
struct DeviceRegistryEntry {
    id: String,
    name: Option<String>,
    #[serde(default)]
    name_by_user: Option<String>,
    manufacturer: Option<String>,
    model: Option<String>,
    sw_version: Option<String>,
    area_id: Option<String>,
}

/// Parse a device registry snapshot. Entries without an id are skipped;
/// anything else malformed fails the whole snapshot.
pub fn parse_device_registry(payload: &serde_json::Value) -> IngestResult<Vec<DeviceRecord>> {
    let entries: Vec<DeviceRegistryEntry> = serde_json::from_value(payload.clone())
        .map_err(|e| IngestError::protocol(format!("device registry payload: {}", e)))?;

    Ok(entries
        .into_iter()
        .filter(|entry| !entry.id.is_empty())
        .map(|entry| DeviceRecord {
            device_id: entry.id,
            // A user-assigned name wins over the integration-reported one.
            name: entry
                .name_by_user
                .or(entry.name)
                .unwrap_or_else(|| "unknown".to_string()),
            manufacturer: entry.manufacturer,
            model: entry.model,
            sw_version: entry.sw_version,
            area_id: entry.area_id,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct EntityRegistryEntry {
    entity_id: String,
    device_id: Option<String>,
    platform: Option<String>,
    #[serde(default)]
    disabled_by: Option<String>,
}

/// Parse an entity registry snapshot.
pub fn parse_entity_registry(payload: &serde_json::Value) -> IngestResult<Vec<EntityRecord>> {
    let entries: Vec<EntityRegistryEntry> = serde_json::from_value(payload.clone())
        .map_err(|e| IngestError::protocol(format!("entity registry payload: {}", e)))?;

    Ok(entries
        .into_iter()
        .filter(|entry| !entry.entity_id.is_empty())
        .map(|entry| EntityRecord {
            domain: NormalizedEvent::domain_of(&entry.entity_id).to_string(),
            platform: entry.platform.unwrap_or_else(|| "unknown".to_string()),
            disabled: entry.disabled_by.is_some(),
            device_id: entry.device_id,
            entity_id: entry.entity_id,
        })
        .collect())
}
