//! # ha-ingest-core
//!
//! Shared foundations of the ingestion pipeline: the event and point models
//! every stage exchanges, the error taxonomy and retry schedules, the
//! environment-driven configuration object, and the metrics registry the
//! supervisor threads through the components.
//!
//! This crate is dependency-light on purpose; the connector and pipeline
//! crates own their network and storage stacks.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod point;

pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use events::{DeviceRecord, EntityRecord, EventSink, EventSource, NormalizedEvent, RawEvent};
pub use metrics::PipelineMetrics;
pub use point::{FieldValue, Point};
