//! # ha-ingest-pipeline
//!
//! The in-process pipeline between the source connector and the stores:
//!
//! - [`intake`]: the bounded dual-policy intake queue.
//! - [`router`]: filter/transform chains and hash-partitioned workers
//!   preserving per-entity order.
//! - [`writer`]: the batching time-series writer with its retry buffer,
//!   over the [`tsdb`] client and [`line_protocol`] encoding.
//! - [`metadata`]: the embedded relational store and its coalescing
//!   synchronizer.
//! - [`enrichment`]: scheduled workers feeding side-channel context into
//!   the same intake.

pub mod enrichment;
pub mod filters;
pub mod intake;
pub mod line_protocol;
pub mod metadata;
pub mod normalize;
pub mod router;
pub mod transforms;
pub mod tsdb;
pub mod writer;

pub use enrichment::{EnrichmentScheduler, EnrichmentWorker, PowerCorrelationWorker, WeatherWorker};
pub use filters::{FilterChain, FilterRule};
pub use intake::{IntakeItem, IntakeQueue};
pub use metadata::{MetadataHandle, MetadataStore, MetadataSynchronizer};
pub use router::EventRouter;
pub use transforms::{TransformChain, TransformRule};
pub use tsdb::TsdbClient;
pub use writer::{Batch, BatchWriter, BatchWriterHandle};
