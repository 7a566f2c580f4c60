//! Scheduled enrichment workers.
//!
//! Each configured kind runs as its own task on an interval-aligned loop
//! with startup jitter. The fetch is awaited inline and missed ticks are
//! skipped, so a slow or stuck fetch never overlaps the next run of the same
//! kind, and, because every kind owns its own task, never delays another
//! kind. Results land in a per-kind TTL cache that rate-limits the external
//! API: within the TTL window the cached events are re-emitted instead of
//! re-fetched. Emission uses the intake queue's evicting path, so a full
//! pipeline sheds enrichment rather than source telemetry.

pub mod power;
pub mod weather;

pub use power::PowerCorrelationWorker;
pub use weather::WeatherWorker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ha_ingest_core::error::IngestResult;
use ha_ingest_core::events::NormalizedEvent;
use ha_ingest_core::metrics::PipelineMetrics;

use crate::intake::IntakeQueue;

/// One periodic enrichment source.
#[async_trait]
pub trait EnrichmentWorker: Send + Sync {
    fn kind(&self) -> &'static str;
    fn interval(&self) -> Duration;
    fn cache_ttl(&self) -> Duration;
    fn fetch_timeout(&self) -> Duration;

    /// Fetch the external datum and shape it as normalized events carrying
    /// fetched-at as their source timestamp.
    async fn fetch(&self) -> IngestResult<Vec<NormalizedEvent>>;
}

/// Value cache that expires after a fixed TTL.
struct TtlCache<T> {
    entry: Option<(Instant, T)>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    fn new(ttl: Duration) -> Self {
        TtlCache { entry: None, ttl }
    }

    fn get(&self) -> Option<T> {
        match &self.entry {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    fn store(&mut self, value: T) {
        self.entry = Some((Instant::now(), value));
    }
}

/// Spawns and owns the per-kind worker tasks.
#[derive(Clone)]
pub struct EnrichmentScheduler {
    intake: Arc<IntakeQueue>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
}

impl EnrichmentScheduler {
    pub fn new(
        intake: Arc<IntakeQueue>,
        metrics: Arc<PipelineMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        EnrichmentScheduler {
            intake,
            metrics,
            shutdown,
        }
    }

    pub fn spawn(&self, worker: Arc<dyn EnrichmentWorker>) -> JoinHandle<()> {
        info!(kind = worker.kind(), interval_s = worker.interval().as_secs(), "starting enrichment worker");
        tokio::spawn(run_worker_loop(
            worker,
            Arc::clone(&self.intake),
            Arc::clone(&self.metrics),
            self.shutdown.clone(),
        ))
    }
}

async fn run_worker_loop(
    worker: Arc<dyn EnrichmentWorker>,
    intake: Arc<IntakeQueue>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) {
    let kind = worker.kind();

    // Spread the first ticks of the configured kinds so they never herd
    // onto the external APIs together.
    let jitter_cap = worker.interval().min(Duration::from_secs(5));
    let jitter = Duration::from_millis(
        rand::thread_rng().gen_range(0..=jitter_cap.as_millis().max(1) as u64),
    );
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = sleep(jitter) => {}
    }

    let mut cache: TtlCache<Vec<NormalizedEvent>> = TtlCache::new(worker.cache_ttl());
    let mut ticker = interval(worker.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind, "enrichment worker stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let events = match cache.get() {
            Some(cached) => {
                metrics
                    .enrichment
                    .cache_hits
                    .with_label_values(&[kind])
                    .inc();
                cached
            }
            None => match timeout(worker.fetch_timeout(), worker.fetch()).await {
                Ok(Ok(events)) => {
                    metrics
                        .enrichment
                        .fetches
                        .with_label_values(&[kind, "success"])
                        .inc();
                    cache.store(events.clone());
                    events
                }
                Ok(Err(err)) => {
                    metrics
                        .enrichment
                        .fetches
                        .with_label_values(&[kind, "error"])
                        .inc();
                    warn!(kind, error = %err, "enrichment fetch failed");
                    continue;
                }
                Err(_) => {
                    metrics
                        .enrichment
                        .fetches
                        .with_label_values(&[kind, "timeout"])
                        .inc();
                    warn!(kind, "enrichment fetch timed out");
                    continue;
                }
            },
        };

        for event in events {
            intake.push_enrichment(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ha_ingest_core::events::EventSource;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingWorker {
        fetches: AtomicU32,
        ttl: Duration,
    }

    #[async_trait]
    impl EnrichmentWorker for CountingWorker {
        fn kind(&self) -> &'static str {
            "counting"
        }
        fn interval(&self) -> Duration {
            Duration::from_millis(30)
        }
        fn cache_ttl(&self) -> Duration {
            self.ttl
        }
        fn fetch_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn fetch(&self) -> IngestResult<Vec<NormalizedEvent>> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![NormalizedEvent::enrichment(
                EventSource::Weather,
                format!("weather.sample_{}", n),
                Utc::now(),
                serde_json::Map::new(),
                None,
            )])
        }
    }

    #[test]
    fn ttl_cache_expires() {
        let mut cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(0));
        cache.store(7);
        assert!(cache.get().is_none());

        let mut cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        cache.store(7);
        assert_eq!(cache.get(), Some(7));
    }

    #[tokio::test]
    async fn cache_rate_limits_fetches_but_events_keep_flowing() {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let shutdown = CancellationToken::new();
        let intake = IntakeQueue::new(64, Arc::clone(&metrics), shutdown.clone());
        let worker = Arc::new(CountingWorker {
            fetches: AtomicU32::new(0),
            ttl: Duration::from_secs(60),
        });

        let scheduler =
            EnrichmentScheduler::new(Arc::clone(&intake), Arc::clone(&metrics), shutdown.clone());
        let handle = scheduler.spawn(worker.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let _ = handle.await;

        // One real fetch; the rest served from cache.
        assert_eq!(worker.fetches.load(Ordering::SeqCst), 1);
        assert!(metrics.enrichment.cache_hits.with_label_values(&["counting"]).get() >= 1);
        assert!(intake.len() >= 2);
    }

    struct FailingWorker;

    #[async_trait]
    impl EnrichmentWorker for FailingWorker {
        fn kind(&self) -> &'static str {
            "failing"
        }
        fn interval(&self) -> Duration {
            Duration::from_millis(20)
        }
        fn cache_ttl(&self) -> Duration {
            Duration::from_millis(1)
        }
        fn fetch_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn fetch(&self) -> IngestResult<Vec<NormalizedEvent>> {
            Err(ha_ingest_core::error::IngestError::transient_network(
                "weather",
                "boom",
            ))
        }
    }

    #[tokio::test]
    async fn failures_are_counted_and_do_not_stop_the_loop() {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let shutdown = CancellationToken::new();
        let intake = IntakeQueue::new(64, Arc::clone(&metrics), shutdown.clone());

        let scheduler =
            EnrichmentScheduler::new(intake, Arc::clone(&metrics), shutdown.clone());
        let handle = scheduler.spawn(Arc::new(FailingWorker));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert!(
            metrics
                .enrichment
                .fetches
                .with_label_values(&["failing", "error"])
                .get()
                >= 2
        );
    }
}
