//! Event router: the single consumer of the intake queue plus a fixed pool
//! of worker tasks.
//!
//! The dispatcher normalizes raw frames, forwards registry snapshots to the
//! metadata synchronizer, and hash-partitions normalized events across the
//! workers by entity id, so two events for the same entity always land on the
//! same worker, which is what preserves per-entity FIFO order without a
//! global lock. Workers run the filter chain, then the transform chain, then
//! fan out: points to the batch writer, discovered entities to the metadata
//! synchronizer. The two dispatches are independent; a failure of one store
//! never fails the other.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use ha_ingest_core::config::RouterConfig;
use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{EntityRecord, EventSource, NormalizedEvent, RawEvent};
use ha_ingest_core::metrics::PipelineMetrics;

use crate::filters::FilterChain;
use crate::intake::{IntakeItem, IntakeQueue};
use crate::metadata::MetadataHandle;
use crate::normalize::{normalize_state_changed, parse_device_registry, parse_entity_registry};
use crate::transforms::TransformChain;
use crate::writer::BatchWriterHandle;

/// Per-worker channel depth; full worker channels backpressure the
/// dispatcher and, through the intake queue, the source.
const WORKER_QUEUE_DEPTH: usize = 512;

pub struct EventRouter {
    workers: usize,
    intake: Arc<IntakeQueue>,
    filters: Arc<FilterChain>,
    transforms: Arc<TransformChain>,
    writer: BatchWriterHandle,
    metadata: MetadataHandle,
    metrics: Arc<PipelineMetrics>,
}

impl EventRouter {
    pub fn new(
        config: &RouterConfig,
        intake: Arc<IntakeQueue>,
        writer: BatchWriterHandle,
        metadata: MetadataHandle,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        EventRouter {
            workers: config.workers.max(1),
            intake,
            filters: Arc::new(FilterChain::from_config(config)),
            transforms: Arc::new(TransformChain::standard()),
            writer,
            metadata,
            metrics,
        }
    }

    /// Run the dispatcher until the intake queue drains after close, then
    /// join the workers.
    pub async fn run(self) -> IngestResult<()> {
        let mut worker_txs = Vec::with_capacity(self.workers);
        let mut worker_handles = Vec::with_capacity(self.workers);
        for slot in 0..self.workers {
            let (tx, rx) = mpsc::channel::<NormalizedEvent>(WORKER_QUEUE_DEPTH);
            worker_txs.push(tx);
            worker_handles.push(tokio::spawn(run_worker(
                slot,
                rx,
                Arc::clone(&self.filters),
                Arc::clone(&self.transforms),
                self.writer.clone(),
                self.metadata.clone(),
                Arc::clone(&self.metrics),
            )));
        }

        while let Some(item) = self.intake.pop().await {
            match item {
                IntakeItem::Source(raw) => self.dispatch_raw(raw, &worker_txs).await?,
                IntakeItem::Enrichment(event) => {
                    self.dispatch_event(event, &worker_txs).await?
                }
            }
        }

        // Intake drained; closing the worker channels lets each worker
        // finish its backlog and exit.
        drop(worker_txs);
        for (slot, handle) in worker_handles.into_iter().enumerate() {
            if let Err(join_err) = handle.await {
                error!(slot, error = %join_err, "router worker panicked");
                return Err(IngestError::protocol(format!(
                    "router worker {} panicked",
                    slot
                )));
            }
        }
        Ok(())
    }

    async fn dispatch_raw(
        &self,
        raw: RawEvent,
        worker_txs: &[mpsc::Sender<NormalizedEvent>],
    ) -> IngestResult<()> {
        match raw.kind.as_str() {
            "state_changed" => match normalize_state_changed(&raw) {
                Ok(event) => self.dispatch_event(event, worker_txs).await?,
                Err(err) => {
                    self.metrics
                        .router
                        .events_dead_lettered
                        .with_label_values(&["protocol"])
                        .inc();
                    debug!(error = %err, "discarding unnormalizable frame");
                }
            },
            "device_registry_snapshot" => match parse_device_registry(&raw.payload) {
                Ok(devices) => {
                    for device in devices {
                        self.metadata.upsert_device(device);
                    }
                }
                Err(err) => {
                    self.metrics
                        .router
                        .events_dead_lettered
                        .with_label_values(&["protocol"])
                        .inc();
                    debug!(error = %err, "discarding device registry snapshot");
                }
            },
            "entity_registry_snapshot" => match parse_entity_registry(&raw.payload) {
                Ok(entities) => {
                    for entity in entities {
                        self.metadata.upsert_entity(entity);
                    }
                }
                Err(err) => {
                    self.metrics
                        .router
                        .events_dead_lettered
                        .with_label_values(&["protocol"])
                        .inc();
                    debug!(error = %err, "discarding entity registry snapshot");
                }
            },
            other => {
                self.metrics
                    .router
                    .events_dead_lettered
                    .with_label_values(&["protocol"])
                    .inc();
                debug!(kind = other, "discarding frame of unknown kind");
            }
        }
        Ok(())
    }

    async fn dispatch_event(
        &self,
        event: NormalizedEvent,
        worker_txs: &[mpsc::Sender<NormalizedEvent>],
    ) -> IngestResult<()> {
        let slot = worker_slot(&event.entity_id, worker_txs.len());
        worker_txs[slot].send(event).await.map_err(|_| {
            IngestError::protocol(format!("router worker {} is no longer accepting work", slot))
        })
    }
}

/// Deterministic entity-to-worker partition.
fn worker_slot(entity_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    entity_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn run_worker(
    slot: usize,
    mut rx: mpsc::Receiver<NormalizedEvent>,
    filters: Arc<FilterChain>,
    transforms: Arc<TransformChain>,
    writer: BatchWriterHandle,
    metadata: MetadataHandle,
    metrics: Arc<PipelineMetrics>,
) {
    let mut seen_entities: HashSet<String> = HashSet::new();

    while let Some(event) = rx.recv().await {
        if let Some(filter_name) = filters.rejects(&event) {
            metrics
                .router
                .events_filtered
                .with_label_values(&[filter_name])
                .inc();
            continue;
        }

        // First sight of an entity id on this worker: make sure a row
        // exists. The partition keeps an entity pinned to one worker, so
        // the local seen-set is enough to avoid re-sending.
        if event.source == EventSource::StateChange
            && seen_entities.insert(event.entity_id.clone())
        {
            metadata.ensure_entity(EntityRecord::stub(&event.entity_id));
        }

        match transforms.apply(&event) {
            Ok(points) => {
                if points.is_empty() {
                    // Legitimate but measurement-less (entity removal);
                    // counted so the accounting still adds up.
                    metrics
                        .router
                        .events_filtered
                        .with_label_values(&["no_measurable_state"])
                        .inc();
                    continue;
                }
                for point in points {
                    if writer.enqueue(point).await.is_err() {
                        warn!(slot, "batch writer gone, stopping worker");
                        return;
                    }
                }
            }
            Err(err) => {
                let reason = err.reason_label();
                metrics
                    .router
                    .events_dead_lettered
                    .with_label_values(&[reason.as_str()])
                    .inc();
                warn!(
                    slot,
                    entity_id = %event.entity_id,
                    correlation_id = %event.correlation_id,
                    reason = %reason,
                    "event dead-lettered"
                );
            }
        }
    }
}
