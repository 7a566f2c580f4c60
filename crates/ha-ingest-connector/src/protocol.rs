//! Home Assistant WebSocket frame vocabulary.
//!
//! Frames are JSON objects discriminated by a `type` field. Outbound frames
//! carry a per-session message id so results can be correlated with the
//! request that produced them. An inbound frame whose `type` is not in this
//! vocabulary fails to decode and is surfaced as a protocol error; the caller
//! counts it and discards the frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ha_ingest_core::error::{IngestError, IngestResult};

/// Frames sent to the source.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        access_token: String,
    },
    SubscribeEvents {
        id: u64,
        event_type: String,
    },
    Ping {
        id: u64,
    },
    Pong {
        id: u64,
    },
    #[serde(rename = "config/device_registry/list")]
    DeviceRegistryList { id: u64 },
    #[serde(rename = "config/entity_registry/list")]
    EntityRegistryList { id: u64 },
}

impl ClientFrame {
    pub fn to_json(&self) -> IngestResult<String> {
        serde_json::to_string(self)
            .map_err(|e| IngestError::protocol(format!("failed to encode frame: {}", e)))
    }
}

/// Frames received from the source.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthRequired {
        ha_version: Option<String>,
    },
    AuthOk {
        ha_version: Option<String>,
    },
    AuthInvalid {
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: serde_json::Value,
        error: Option<ResultError>,
    },
    Event {
        id: u64,
        event: EventFrame,
    },
    Ping {
        #[serde(default)]
        id: Option<u64>,
    },
    Pong {
        #[serde(default)]
        id: Option<u64>,
    },
}

impl ServerFrame {
    /// Decode a text frame; malformed JSON and unknown `type` tags are both
    /// protocol errors.
    pub fn parse(text: &str) -> IngestResult<ServerFrame> {
        serde_json::from_str(text)
            .map_err(|e| IngestError::protocol(format!("undecodable frame: {}", e)))
    }
}

/// Error object attached to a failed `result` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Inner `event` object of an event frame.
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub origin: Option<String>,
    pub time_fired: Option<DateTime<Utc>>,
}

impl EventFrame {
    /// Payload handed to normalization: the event data plus the envelope
    /// fields normalization needs.
    pub fn into_payload(self) -> serde_json::Value {
        serde_json::json!({
            "data": self.data,
            "origin": self.origin,
            "time_fired": self.time_fired,
        })
    }
}
