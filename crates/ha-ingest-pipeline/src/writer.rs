//! Batching writer in front of the time-series store.
//!
//! Points arrive on a channel and accumulate into the current batch, which
//! flushes when it reaches the configured size, when its oldest point
//! reaches the configured age, or unconditionally at shutdown. Transient
//! flush failures park the batch in a bounded retry buffer drained by a
//! dedicated retry task, so retries never block intake. Permanent failures
//! dead-letter the whole batch with a reason counter; there is no dead-letter
//! store beyond the counters and a structured log line.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ha_ingest_core::config::TsdbConfig;
use ha_ingest_core::error::{IngestError, IngestResult, RetryPolicy};
use ha_ingest_core::metrics::PipelineMetrics;
use ha_ingest_core::point::Point;

use crate::line_protocol::encode_batch;
use crate::tsdb::{dead_letter_reason, TsdbClient};

/// Consecutive credential rejections tolerated before the writer gives up.
const MAX_CONSECUTIVE_AUTH_FAILURES: u32 = 3;

/// An in-flight set of points awaiting flush.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub points: Vec<Point>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

impl Batch {
    fn new(points: Vec<Point>) -> Self {
        Batch {
            id: Uuid::new_v4(),
            points,
            created_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Cloneable intake handle given to the router workers.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<Point>,
}

impl BatchWriterHandle {
    /// Enqueue one point. Fails only once the writer has shut down.
    pub async fn enqueue(&self, point: Point) -> IngestResult<()> {
        self.tx
            .send(point)
            .await
            .map_err(|_| IngestError::Shutdown)
    }
}

struct RetryBufferState {
    queue: VecDeque<Batch>,
    closed: bool,
}

/// Bounded buffer of batches awaiting retry. Overflow dead-letters the
/// oldest batch to reclaim space.
struct RetryBuffer {
    state: Mutex<RetryBufferState>,
    notify: Notify,
    capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

impl RetryBuffer {
    fn new(capacity: usize, metrics: Arc<PipelineMetrics>) -> Arc<Self> {
        Arc::new(RetryBuffer {
            state: Mutex::new(RetryBufferState {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            metrics,
        })
    }

    fn park(&self, batch: Batch) {
        let evicted = {
            let mut state = self.state.lock().expect("retry buffer lock");
            let evicted = if state.queue.len() >= self.capacity {
                state.queue.pop_front()
            } else {
                None
            };
            state.queue.push_back(batch);
            self.metrics
                .writer
                .retry_buffer_depth
                .set(state.queue.len() as i64);
            evicted
        };
        if let Some(old) = evicted {
            dead_letter(&self.metrics, &old, "tsdb:retry_overflow");
        }
        self.notify.notify_one();
    }

    async fn next(&self) -> Option<Batch> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("retry buffer lock");
                if let Some(batch) = state.queue.pop_front() {
                    self.metrics
                        .writer
                        .retry_buffer_depth
                        .set(state.queue.len() as i64);
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.state.lock().expect("retry buffer lock").closed = true;
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().expect("retry buffer lock").closed
    }
}

fn dead_letter(metrics: &PipelineMetrics, batch: &Batch, reason: &str) {
    metrics
        .writer
        .points_dead_lettered
        .with_label_values(&[reason])
        .inc_by(batch.points.len() as u64);
    warn!(
        batch_id = %batch.id,
        points = batch.points.len(),
        reason,
        "batch dead-lettered"
    );
}

/// The batch writer: one flusher task plus one retry task.
pub struct BatchWriter {
    config: TsdbConfig,
    client: TsdbClient,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
    rx: mpsc::Receiver<Point>,
    retry: Arc<RetryBuffer>,
    consecutive_auth_failures: u32,
}

impl BatchWriter {
    pub fn channel(
        config: TsdbConfig,
        client: TsdbClient,
        metrics: Arc<PipelineMetrics>,
        shutdown: CancellationToken,
    ) -> (BatchWriter, BatchWriterHandle) {
        // Enough headroom that intake never stalls on a flush in progress.
        let (tx, rx) = mpsc::channel(config.batch_size.saturating_mul(2).max(64));
        let retry = RetryBuffer::new(config.retry_buffer_batches, Arc::clone(&metrics));
        (
            BatchWriter {
                config,
                client,
                metrics,
                shutdown,
                rx,
                retry,
                consecutive_auth_failures: 0,
            },
            BatchWriterHandle { tx },
        )
    }

    /// Run until the intake channel closes and all parked batches have been
    /// resolved. Returns an error only when the store credential is
    /// rejected repeatedly.
    pub async fn run(mut self) -> IngestResult<()> {
        let retry_task = tokio::spawn(run_retry(
            Arc::clone(&self.retry),
            self.client.clone(),
            Arc::clone(&self.metrics),
            self.shutdown.clone(),
            RetryPolicy::store_writes(),
        ));

        let result = self.run_flusher().await;

        // No more parks can happen; let the retry task drain and stop.
        self.retry.close();
        match retry_task.await {
            Ok(retry_result) => result.and(retry_result),
            Err(join_err) => {
                error!(error = %join_err, "retry task panicked");
                Err(IngestError::persistence_permanent(
                    "tsdb",
                    format!("retry task panicked: {}", join_err),
                ))
            }
        }
    }

    async fn run_flusher(&mut self) -> IngestResult<()> {
        let mut current: Vec<Point> = Vec::with_capacity(self.config.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let flush_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                maybe_point = self.rx.recv() => match maybe_point {
                    Some(point) => {
                        if current.is_empty() {
                            deadline = Some(Instant::now() + self.config.flush_interval);
                        }
                        current.push(point);
                        if current.len() >= self.config.batch_size {
                            let batch = Batch::new(std::mem::take(&mut current));
                            deadline = None;
                            self.flush(batch).await?;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(flush_at), if deadline.is_some() => {
                    let batch = Batch::new(std::mem::take(&mut current));
                    deadline = None;
                    self.flush(batch).await?;
                }
            }
        }

        // Shutdown: unconditional final flush of the partial batch.
        if !current.is_empty() {
            let batch = Batch::new(current);
            info!(points = batch.points.len(), "final flush");
            self.flush(batch).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, batch: Batch) -> IngestResult<()> {
        let body = encode_batch(&batch.points);
        if body.is_empty() {
            return Ok(());
        }
        debug!(batch_id = %batch.id, points = batch.points.len(), "flushing batch");
        let timer = self.metrics.writer.flush_duration.start_timer();
        let result = self.client.write_lines(body).await;
        timer.observe_duration();

        match result {
            Ok(()) => {
                self.consecutive_auth_failures = 0;
                self.metrics
                    .writer
                    .points_written
                    .inc_by(batch.points.len() as u64);
                self.metrics.writer.batches_flushed.inc();
                self.metrics
                    .writer
                    .last_flush_timestamp
                    .set(Utc::now().timestamp_millis() as f64 / 1000.0);
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                warn!(batch_id = %batch.id, error = %err, "flush failed, parking for retry");
                self.retry.park(batch);
                Ok(())
            }
            Err(err) => {
                dead_letter(&self.metrics, &batch, dead_letter_reason(&err));
                if matches!(err, IngestError::Authentication { .. }) {
                    self.consecutive_auth_failures += 1;
                    if self.consecutive_auth_failures >= MAX_CONSECUTIVE_AUTH_FAILURES {
                        error!("store credential rejected repeatedly, giving up");
                        return Err(err);
                    }
                }
                Ok(())
            }
        }
    }
}

/// Retry task: drains parked batches on the store-write backoff schedule.
/// Once shutdown is requested the remaining batches get one immediate
/// attempt each; stragglers are dead-lettered so the process can exit.
async fn run_retry(
    retry: Arc<RetryBuffer>,
    client: TsdbClient,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
    policy: RetryPolicy,
) -> IngestResult<()> {
    while let Some(mut batch) = retry.next().await {
        if !shutdown.is_cancelled() {
            let delay = policy.delay_for(batch.attempts);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(delay) => {}
            }
        }

        batch.attempts += 1;
        metrics.writer.batches_retried.inc();
        let body = encode_batch(&batch.points);
        match client.write_lines(body).await {
            Ok(()) => {
                metrics
                    .writer
                    .points_written
                    .inc_by(batch.points.len() as u64);
                metrics.writer.batches_flushed.inc();
                metrics
                    .writer
                    .last_flush_timestamp
                    .set(Utc::now().timestamp_millis() as f64 / 1000.0);
                debug!(batch_id = %batch.id, attempts = batch.attempts, "retry succeeded");
            }
            Err(err) if err.is_retryable() && !shutdown.is_cancelled() && !retry.is_closed() => {
                retry.park(batch);
            }
            Err(err) if err.is_retryable() => {
                // Out of time; record the loss instead of blocking shutdown.
                dead_letter(&metrics, &batch, "shutdown");
                debug!(error = %err, "dropping retry during shutdown");
            }
            Err(err) => {
                dead_letter(&metrics, &batch, dead_letter_reason(&err));
            }
        }
    }
    Ok(())
}
