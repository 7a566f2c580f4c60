/*!
# Pipeline Metrics

Counter, gauge and histogram inventory for the whole pipeline, owned by one
[`PipelineMetrics`] value constructed by the supervisor and passed to each
component at construction. Components never reach for a global registry;
the supervisor is the single owner and the health endpoint renders the text
encoding.
*/

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "ha_ingest";

/// Source connector counters.
#[derive(Clone)]
pub struct ConnectorMetrics {
    pub connect_attempts: IntCounter,
    pub reconnects: IntCounter,
    pub frames_received: IntCounter,
    pub protocol_errors: IntCounter,
    /// Numeric connection state, see the connector's state mapping.
    pub state: IntGauge,
    /// Unix seconds of the last frame received.
    pub last_frame_timestamp: Gauge,
}

/// Router and intake queue counters.
#[derive(Clone)]
pub struct RouterMetrics {
    pub events_ingested: IntCounterVec,
    pub events_filtered: IntCounterVec,
    pub events_dead_lettered: IntCounterVec,
    pub enrichment_events_dropped: IntCounter,
    pub intake_queue_depth: IntGauge,
}

/// Batch writer counters.
#[derive(Clone)]
pub struct WriterMetrics {
    pub points_written: IntCounter,
    pub points_dead_lettered: IntCounterVec,
    pub batches_flushed: IntCounter,
    pub batches_retried: IntCounter,
    pub flush_duration: Histogram,
    pub retry_buffer_depth: IntGauge,
    /// Unix seconds of the last successful flush.
    pub last_flush_timestamp: Gauge,
}

/// Metadata synchronizer counters.
#[derive(Clone)]
pub struct MetadataMetrics {
    pub devices_upserted: IntCounter,
    pub entities_upserted: IntCounter,
    pub upsert_failures: IntCounter,
}

/// Enrichment worker counters.
#[derive(Clone)]
pub struct EnrichmentMetrics {
    pub fetches: IntCounterVec,
    pub cache_hits: IntCounterVec,
}

/// Root metrics collaborator.
pub struct PipelineMetrics {
    registry: Registry,
    pub connector: ConnectorMetrics,
    pub router: RouterMetrics,
    pub writer: WriterMetrics,
    pub metadata: MetadataMetrics,
    pub enrichment: EnrichmentMetrics,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connector = ConnectorMetrics {
            connect_attempts: IntCounter::with_opts(
                Opts::new("connect_attempts_total", "Connection attempts to the source")
                    .namespace(NAMESPACE)
                    .subsystem("connector"),
            )?,
            reconnects: IntCounter::with_opts(
                Opts::new("reconnects_total", "Reconnections after an established link broke")
                    .namespace(NAMESPACE)
                    .subsystem("connector"),
            )?,
            frames_received: IntCounter::with_opts(
                Opts::new("frames_received_total", "Frames received on the source link")
                    .namespace(NAMESPACE)
                    .subsystem("connector"),
            )?,
            protocol_errors: IntCounter::with_opts(
                Opts::new("protocol_errors_total", "Malformed or unexpected source frames")
                    .namespace(NAMESPACE)
                    .subsystem("connector"),
            )?,
            state: IntGauge::with_opts(
                Opts::new("state", "Connection state (0=disconnected .. 5=stopping)")
                    .namespace(NAMESPACE)
                    .subsystem("connector"),
            )?,
            last_frame_timestamp: Gauge::with_opts(
                Opts::new(
                    "last_frame_timestamp_seconds",
                    "Unix time of the last frame received",
                )
                .namespace(NAMESPACE)
                .subsystem("connector"),
            )?,
        };

        let router = RouterMetrics {
            events_ingested: IntCounterVec::new(
                Opts::new("events_ingested_total", "Events accepted into the intake queue")
                    .namespace(NAMESPACE)
                    .subsystem("router"),
                &["source"],
            )?,
            events_filtered: IntCounterVec::new(
                Opts::new("events_filtered_total", "Events rejected by a filter")
                    .namespace(NAMESPACE)
                    .subsystem("router"),
                &["filter"],
            )?,
            events_dead_lettered: IntCounterVec::new(
                Opts::new("events_dead_lettered_total", "Events dead-lettered by reason")
                    .namespace(NAMESPACE)
                    .subsystem("router"),
                &["reason"],
            )?,
            enrichment_events_dropped: IntCounter::with_opts(
                Opts::new(
                    "enrichment_events_dropped_total",
                    "Enrichment events evicted from a full intake queue",
                )
                .namespace(NAMESPACE)
                .subsystem("router"),
            )?,
            intake_queue_depth: IntGauge::with_opts(
                Opts::new("intake_queue_depth", "Events currently queued at intake")
                    .namespace(NAMESPACE)
                    .subsystem("router"),
            )?,
        };

        let writer = WriterMetrics {
            points_written: IntCounter::with_opts(
                Opts::new("points_written_total", "Points acknowledged by the time-series store")
                    .namespace(NAMESPACE)
                    .subsystem("writer"),
            )?,
            points_dead_lettered: IntCounterVec::new(
                Opts::new("points_dead_lettered_total", "Points dead-lettered by reason")
                    .namespace(NAMESPACE)
                    .subsystem("writer"),
                &["reason"],
            )?,
            batches_flushed: IntCounter::with_opts(
                Opts::new("batches_flushed_total", "Batches successfully flushed")
                    .namespace(NAMESPACE)
                    .subsystem("writer"),
            )?,
            batches_retried: IntCounter::with_opts(
                Opts::new("batches_retried_total", "Batch flushes retried after transient failure")
                    .namespace(NAMESPACE)
                    .subsystem("writer"),
            )?,
            flush_duration: Histogram::with_opts(
                HistogramOpts::new("flush_duration_seconds", "Duration of batch flush requests")
                    .namespace(NAMESPACE)
                    .subsystem("writer")
                    .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            )?,
            retry_buffer_depth: IntGauge::with_opts(
                Opts::new("retry_buffer_depth", "Batches parked in the retry buffer")
                    .namespace(NAMESPACE)
                    .subsystem("writer"),
            )?,
            last_flush_timestamp: Gauge::with_opts(
                Opts::new(
                    "last_flush_timestamp_seconds",
                    "Unix time of the last successful flush",
                )
                .namespace(NAMESPACE)
                .subsystem("writer"),
            )?,
        };

        let metadata = MetadataMetrics {
            devices_upserted: IntCounter::with_opts(
                Opts::new("devices_upserted_total", "Device rows upserted")
                    .namespace(NAMESPACE)
                    .subsystem("metadata"),
            )?,
            entities_upserted: IntCounter::with_opts(
                Opts::new("entities_upserted_total", "Entity rows upserted")
                    .namespace(NAMESPACE)
                    .subsystem("metadata"),
            )?,
            upsert_failures: IntCounter::with_opts(
                Opts::new("upsert_failures_total", "Metadata upsert transactions that failed")
                    .namespace(NAMESPACE)
                    .subsystem("metadata"),
            )?,
        };

        let enrichment = EnrichmentMetrics {
            fetches: IntCounterVec::new(
                Opts::new("fetches_total", "Enrichment fetch attempts by kind and outcome")
                    .namespace(NAMESPACE)
                    .subsystem("enrichment"),
                &["kind", "outcome"],
            )?,
            cache_hits: IntCounterVec::new(
                Opts::new("cache_hits_total", "Enrichment fetches served from the TTL cache")
                    .namespace(NAMESPACE)
                    .subsystem("enrichment"),
                &["kind"],
            )?,
        };

        registry.register(Box::new(connector.connect_attempts.clone()))?;
        registry.register(Box::new(connector.reconnects.clone()))?;
        registry.register(Box::new(connector.frames_received.clone()))?;
        registry.register(Box::new(connector.protocol_errors.clone()))?;
        registry.register(Box::new(connector.state.clone()))?;
        registry.register(Box::new(connector.last_frame_timestamp.clone()))?;

        registry.register(Box::new(router.events_ingested.clone()))?;
        registry.register(Box::new(router.events_filtered.clone()))?;
        registry.register(Box::new(router.events_dead_lettered.clone()))?;
        registry.register(Box::new(router.enrichment_events_dropped.clone()))?;
        registry.register(Box::new(router.intake_queue_depth.clone()))?;

        registry.register(Box::new(writer.points_written.clone()))?;
        registry.register(Box::new(writer.points_dead_lettered.clone()))?;
        registry.register(Box::new(writer.batches_flushed.clone()))?;
        registry.register(Box::new(writer.batches_retried.clone()))?;
        registry.register(Box::new(writer.flush_duration.clone()))?;
        registry.register(Box::new(writer.retry_buffer_depth.clone()))?;
        registry.register(Box::new(writer.last_flush_timestamp.clone()))?;

        registry.register(Box::new(metadata.devices_upserted.clone()))?;
        registry.register(Box::new(metadata.entities_upserted.clone()))?;
        registry.register(Box::new(metadata.upsert_failures.clone()))?;

        registry.register(Box::new(enrichment.fetches.clone()))?;
        registry.register(Box::new(enrichment.cache_hits.clone()))?;

        Ok(PipelineMetrics {
            registry,
            connector,
            router,
            writer,
            metadata,
            enrichment,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of the whole registry.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_construct_and_encode() {
        let metrics = PipelineMetrics::new().expect("metrics registry");
        metrics.connector.connect_attempts.inc();
        metrics
            .router
            .events_dead_lettered
            .with_label_values(&["transform:state_to_point"])
            .inc();
        metrics.writer.points_written.inc_by(3);

        let text = metrics.encode_text().expect("encode");
        assert!(text.contains("ha_ingest_connector_connect_attempts_total"));
        assert!(text.contains("ha_ingest_router_events_dead_lettered_total"));
        assert!(text.contains("ha_ingest_writer_points_written_total"));
    }

    #[test]
    fn dead_letter_counter_accumulates_by_reason() {
        let metrics = PipelineMetrics::new().expect("metrics registry");
        let reason = "tsdb:schema";
        metrics
            .writer
            .points_dead_lettered
            .with_label_values(&[reason])
            .inc_by(1000);
        assert_eq!(
            metrics
                .writer
                .points_dead_lettered
                .with_label_values(&[reason])
                .get(),
            1000
        );
    }
}
