//! Event models shared across the pipeline.
//!
//! A [`RawEvent`] is an opaque frame taken off the source link; it is never
//! persisted. Normalization turns it into a [`NormalizedEvent`], the canonical
//! record every filter, transform and sink operates on. Enrichment workers
//! produce the same record with a non-state [`EventSource`] tag.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IngestResult;

/// Origin of a normalized event, used as a low-cardinality tag downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    StateChange,
    Weather,
    PowerCorrelation,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::StateChange => "state_change",
            EventSource::Weather => "weather",
            EventSource::PowerCorrelation => "power_correlation",
        }
    }
}

/// An opaque frame received from the source link.
///
/// Carries both a monotonic receipt instant (for heartbeat accounting) and
/// the wall-clock receipt time that ends up on the normalized record.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Source event kind, e.g. `state_changed` or `registry_snapshot`.
    pub kind: String,
    /// The nested `data` payload of the source frame.
    pub payload: serde_json::Value,
    pub received_at: Instant,
    pub received_wall: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            received_at: Instant::now(),
            received_wall: Utc::now(),
        }
    }
}

/// The canonical internal record produced from a [`RawEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub entity_id: String,
    /// Left component of `entity_id`.
    pub domain: String,
    pub previous_state: Option<String>,
    pub new_state: Option<String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Wall-clock time reported by the source (`time_fired` for state
    /// changes, fetched-at for enrichment).
    pub source_timestamp: DateTime<Utc>,
    pub receipt_timestamp: DateTime<Utc>,
    /// Stable hash of `entity_id` + `source_timestamp`; downstream consumers
    /// dedup on this across at-least-once redelivery.
    pub correlation_id: String,
    pub source: EventSource,
}

impl NormalizedEvent {
    /// Stable correlation id: SHA-256 over entity id and the RFC 3339
    /// nanosecond rendering of the source timestamp, truncated to 16 bytes.
    pub fn correlation_id_for(entity_id: &str, source_timestamp: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entity_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(
            source_timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        let digest = hasher.finalize();
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Domain is the left component of a dotted entity id; ids without a dot
    /// map to the `unknown` domain rather than being rejected.
    pub fn domain_of(entity_id: &str) -> &str {
        match entity_id.split_once('.') {
            Some((domain, _)) if !domain.is_empty() => domain,
            _ => "unknown",
        }
    }

    /// Build an enrichment record with the fetched-at timestamp as its
    /// source timestamp.
    pub fn enrichment(
        source: EventSource,
        entity_id: impl Into<String>,
        fetched_at: DateTime<Utc>,
        attributes: serde_json::Map<String, serde_json::Value>,
        state: Option<String>,
    ) -> Self {
        let entity_id = entity_id.into();
        let correlation_id = Self::correlation_id_for(&entity_id, fetched_at);
        let domain = Self::domain_of(&entity_id).to_string();
        NormalizedEvent {
            event_type: source.as_str().to_string(),
            entity_id,
            domain,
            previous_state: None,
            new_state: state,
            attributes,
            source_timestamp: fetched_at,
            receipt_timestamp: Utc::now(),
            correlation_id,
            source,
        }
    }
}

/// Device metadata discovered from the source, upserted into the metadata
/// store keyed by `device_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub area_id: Option<String>,
}

/// Entity metadata discovered from the source, upserted keyed by
/// `entity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub device_id: Option<String>,
    pub domain: String,
    pub platform: String,
    pub disabled: bool,
}

impl EntityRecord {
    /// Minimal row synthesized the first time an unknown entity id appears
    /// in the stream; a later registry snapshot fills in the rest.
    pub fn stub(entity_id: &str) -> Self {
        EntityRecord {
            entity_id: entity_id.to_string(),
            device_id: None,
            domain: NormalizedEvent::domain_of(entity_id).to_string(),
            platform: "unknown".to_string(),
            disabled: false,
        }
    }
}

/// Seam between the source connector and the pipeline intake.
///
/// The intake queue implements this with blocking semantics: when the queue
/// is full the call suspends until space frees up, which is how backpressure
/// reaches the source reader.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: RawEvent) -> IngestResult<()>;
}
