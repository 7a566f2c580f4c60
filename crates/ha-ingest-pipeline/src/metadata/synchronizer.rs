//! Write-side aggregator in front of the metadata store.
//!
//! Router workers hand device/entity records to a [`MetadataHandle`] without
//! ever blocking; a single coalescing task collects what arrives within the
//! configured window and commits it as one transaction batch. Later records
//! for the same key win within a window. Write failures retry on the shared
//! store-write backoff schedule; only permanent store errors propagate.

use std::collections::BTreeMap;
use std::time::Duration;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use ha_ingest_core::error::{IngestError, IngestResult, RetryPolicy};
use ha_ingest_core::events::{DeviceRecord, EntityRecord};
use ha_ingest_core::metrics::PipelineMetrics;

use super::store::MetadataStore;

/// Upper bound on one coalesced commit; a registry snapshot of a large
/// installation stays well under this.
const MAX_OPS_PER_COMMIT: usize = 4096;

/// One unit of metadata work.
#[derive(Debug, Clone)]
pub enum MetadataOp {
    UpsertDevice(DeviceRecord),
    UpsertEntity(EntityRecord),
    /// Insert-if-absent used for stubs synthesized from the event stream;
    /// never overwrites registry data.
    EnsureEntity(EntityRecord),
}

/// Non-blocking sender handed to the router.
#[derive(Clone)]
pub struct MetadataHandle {
    tx: mpsc::UnboundedSender<MetadataOp>,
}

impl MetadataHandle {
    pub fn upsert_device(&self, record: DeviceRecord) {
        let _ = self.tx.send(MetadataOp::UpsertDevice(record));
    }

    pub fn upsert_entity(&self, record: EntityRecord) {
        let _ = self.tx.send(MetadataOp::UpsertEntity(record));
    }

    pub fn ensure_entity(&self, record: EntityRecord) {
        let _ = self.tx.send(MetadataOp::EnsureEntity(record));
    }
}

/// The single coalescing writer task.
pub struct MetadataSynchronizer {
    store: MetadataStore,
    rx: mpsc::UnboundedReceiver<MetadataOp>,
    window: Duration,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
}

impl MetadataSynchronizer {
    pub fn channel(
        store: MetadataStore,
        window: Duration,
        metrics: Arc<PipelineMetrics>,
        shutdown: CancellationToken,
    ) -> (MetadataSynchronizer, MetadataHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MetadataSynchronizer {
                store,
                rx,
                window,
                metrics,
                shutdown,
            },
            MetadataHandle { tx },
        )
    }

    /// Run until every producer handle has been dropped and pending work is
    /// committed.
    pub async fn run(mut self) -> IngestResult<()> {
        while let Some(first) = self.rx.recv().await {
            let mut ops = vec![first];
            let deadline = Instant::now() + self.window;
            loop {
                tokio::select! {
                    maybe = self.rx.recv() => match maybe {
                        Some(op) => {
                            ops.push(op);
                            if ops.len() >= MAX_OPS_PER_COMMIT {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = sleep_until(deadline) => break,
                }
            }
            self.commit(ops).await?;
        }
        Ok(())
    }

    /// Coalesce a window of operations and commit them with retry.
    async fn commit(&self, ops: Vec<MetadataOp>) -> IngestResult<()> {
        let mut devices: BTreeMap<String, DeviceRecord> = BTreeMap::new();
        let mut entities: BTreeMap<String, EntityRecord> = BTreeMap::new();
        let mut stubs: BTreeMap<String, EntityRecord> = BTreeMap::new();
        for op in ops {
            match op {
                MetadataOp::UpsertDevice(record) => {
                    devices.insert(record.device_id.clone(), record);
                }
                MetadataOp::UpsertEntity(record) => {
                    stubs.remove(&record.entity_id);
                    entities.insert(record.entity_id.clone(), record);
                }
                MetadataOp::EnsureEntity(record) => {
                    if !entities.contains_key(&record.entity_id) {
                        stubs.insert(record.entity_id.clone(), record);
                    }
                }
            }
        }

        let device_batch: Vec<DeviceRecord> = devices.into_values().collect();
        let entity_batch: Vec<EntityRecord> = entities.into_values().collect();
        let stub_batch: Vec<EntityRecord> = stubs.into_values().collect();
        debug!(
            devices = device_batch.len(),
            entities = entity_batch.len(),
            stubs = stub_batch.len(),
            "committing metadata window"
        );

        let mut backoff = RetryPolicy::store_writes().backoff();
        loop {
            let store = self.store.clone();
            let devices = device_batch.clone();
            let entities = entity_batch.clone();
            let stubs = stub_batch.clone();
            let result = tokio::task::spawn_blocking(move || {
                let devices_written = store.upsert_devices(&devices)?;
                let entities_written = store.upsert_entities(&entities)?;
                let stubs_inserted = store.ensure_entities(&stubs)?;
                store.refresh_entity_counts()?;
                Ok::<_, IngestError>((devices_written, entities_written, stubs_inserted))
            })
            .await
            .map_err(|join_err| {
                IngestError::persistence_permanent(
                    "metadata",
                    format!("commit task panicked: {}", join_err),
                )
            })?;

            match result {
                Ok((devices_written, entities_written, stubs_inserted)) => {
                    self.metrics
                        .metadata
                        .devices_upserted
                        .inc_by(devices_written as u64);
                    self.metrics
                        .metadata
                        .entities_upserted
                        .inc_by((entities_written + stubs_inserted) as u64);
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    self.metrics.metadata.upsert_failures.inc();
                    if self.shutdown.is_cancelled() && backoff.attempt() >= 1 {
                        warn!(error = %err, "dropping metadata window during shutdown");
                        return Ok(());
                    }
                    let delay = backoff.next_delay();
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "metadata commit failed, retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = sleep(delay) => {}
                    }
                }
                Err(err) => {
                    self.metrics.metadata.upsert_failures.inc();
                    error!(error = %err, "metadata commit failed permanently");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_ingest_core::config::MetadataConfig;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> MetadataStore {
        MetadataStore::open(&MetadataConfig {
            db_path: dir.path().join("meta.db").to_string_lossy().into_owned(),
            coalesce_window: Duration::from_millis(50),
        })
        .expect("store")
    }

    fn device(id: &str, name: &str) -> DeviceRecord {
        DeviceRecord {
            device_id: id.to_string(),
            name: name.to_string(),
            manufacturer: None,
            model: None,
            sw_version: None,
            area_id: None,
        }
    }

    #[tokio::test]
    async fn coalesces_and_commits_last_wins() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (sync, handle) = MetadataSynchronizer::channel(
            store.clone(),
            Duration::from_millis(50),
            metrics,
            CancellationToken::new(),
        );

        handle.upsert_device(device("dev1", "First"));
        handle.upsert_device(device("dev1", "Second"));
        drop(handle);

        sync.run().await.unwrap();
        let row = store.device("dev1").unwrap().expect("row");
        assert_eq!(row.name, "Second");
    }

    #[tokio::test]
    async fn ensure_after_upsert_in_same_window_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (sync, handle) = MetadataSynchronizer::channel(
            store.clone(),
            Duration::from_millis(50),
            metrics,
            CancellationToken::new(),
        );

        handle.upsert_entity(EntityRecord {
            entity_id: "light.kitchen".to_string(),
            device_id: Some("dev1".to_string()),
            domain: "light".to_string(),
            platform: "hue".to_string(),
            disabled: false,
        });
        handle.ensure_entity(EntityRecord::stub("light.kitchen"));
        drop(handle);

        sync.run().await.unwrap();
        let row = store.entity("light.kitchen").unwrap().expect("row");
        assert_eq!(row.platform, "hue");
    }

    #[tokio::test]
    async fn pending_ops_commit_when_producers_drop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (sync, handle) = MetadataSynchronizer::channel(
            store.clone(),
            Duration::from_secs(60),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );

        handle.ensure_entity(EntityRecord::stub("sensor.temp"));
        drop(handle);

        // A one-minute window must not delay the close-out commit.
        tokio::time::timeout(Duration::from_secs(5), sync.run())
            .await
            .expect("run finished promptly")
            .unwrap();
        assert_eq!(store.entity_count().unwrap(), 1);
        assert_eq!(metrics.metadata.entities_upserted.get(), 1);
    }
}
