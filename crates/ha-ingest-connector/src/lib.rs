//! # ha-ingest-connector
//!
//! Home Assistant WebSocket source connector. Maintains exactly one logical
//! subscription to the upstream instance, surfaces state-change frames as an
//! ordered stream of raw events, and owns reconnection: exponential backoff
//! with full jitter, a heartbeat watchdog, and bounded tolerance for
//! credential rejection.

pub mod connector;
pub mod protocol;
pub mod status;

pub use connector::HaConnector;
pub use status::{ConnectionState, ConnectorStatus};
