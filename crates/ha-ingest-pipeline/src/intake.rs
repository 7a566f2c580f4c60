//! Bounded intake queue in front of the event router.
//!
//! Two producer policies share one queue:
//!
//! - Source events (the connector) **block** when the queue is full. The
//!   upstream link is the one true source; delaying it is better than
//!   dropping it, and the suspended reader is exactly how backpressure
//!   propagates to the socket.
//! - Enrichment events **evict** instead of blocking: when the queue is
//!   full the oldest enrichment event is removed (or, if only source
//!   events are queued, the new one is discarded) and a counter records
//!   the eviction. Enrichment is periodic and re-generated, so this loses
//!   nothing durable.
//!
//! The single consumer is the router dispatcher. `close()` begins drain:
//! producers are refused, `pop` keeps returning queued items until empty,
//! then yields `None`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{EventSink, NormalizedEvent, RawEvent};
use ha_ingest_core::metrics::PipelineMetrics;

/// One queued unit of work for the router.
#[derive(Debug)]
pub enum IntakeItem {
    Source(RawEvent),
    Enrichment(NormalizedEvent),
}

struct IntakeState {
    queue: VecDeque<IntakeItem>,
    closed: bool,
}

/// Bounded dual-policy intake queue.
pub struct IntakeQueue {
    state: Mutex<IntakeState>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
}

impl IntakeQueue {
    pub fn new(
        capacity: usize,
        metrics: Arc<PipelineMetrics>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(IntakeQueue {
            state: Mutex::new(IntakeState {
                queue: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            metrics,
            shutdown,
        })
    }

    /// Blocking enqueue used by the source connector. Suspends while the
    /// queue is full; returns `Shutdown` once cancellation is requested.
    pub async fn push_source(&self, event: RawEvent) -> IngestResult<()> {
        let mut item = Some(IntakeItem::Source(event));
        loop {
            if self.shutdown.is_cancelled() {
                return Err(IngestError::Shutdown);
            }
            let notified = self.not_full.notified();
            {
                let mut state = self.state.lock().expect("intake lock");
                if state.closed {
                    return Err(IngestError::Shutdown);
                }
                if state.queue.len() < self.capacity {
                    state.queue.push_back(item.take().expect("item consumed once"));
                    self.metrics
                        .router
                        .intake_queue_depth
                        .set(state.queue.len() as i64);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(IngestError::Shutdown),
                _ = notified => {}
            }
        }
    }

    /// Non-blocking enqueue used by enrichment workers. A full queue evicts
    /// the oldest enrichment item, or discards the incoming one when the
    /// queue holds only source events; either way the drop counter moves.
    pub fn push_enrichment(&self, event: NormalizedEvent) {
        let mut state = self.state.lock().expect("intake lock");
        if state.closed {
            return;
        }
        if state.queue.len() >= self.capacity {
            let evicted = {
                let position = state
                    .queue
                    .iter()
                    .position(|item| matches!(item, IntakeItem::Enrichment(_)));
                match position {
                    Some(index) => {
                        state.queue.remove(index);
                        true
                    }
                    None => false,
                }
            };
            self.metrics.router.enrichment_events_dropped.inc();
            if !evicted {
                // Queue is wall-to-wall source events; drop the newcomer.
                return;
            }
        }
        self.metrics
            .router
            .events_ingested
            .with_label_values(&[event.source.as_str()])
            .inc();
        state.queue.push_back(IntakeItem::Enrichment(event));
        self.metrics
            .router
            .intake_queue_depth
            .set(state.queue.len() as i64);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Dequeue the next item in arrival order. Returns `None` only after
    /// `close()` has been called and the queue has fully drained.
    pub async fn pop(&self) -> Option<IntakeItem> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.state.lock().expect("intake lock");
                if let Some(item) = state.queue.pop_front() {
                    self.metrics
                        .router
                        .intake_queue_depth
                        .set(state.queue.len() as i64);
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse new work and let the consumer drain what is queued.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("intake lock");
            state.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("intake lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for IntakeQueue {
    async fn deliver(&self, event: RawEvent) -> IngestResult<()> {
        self.metrics
            .router
            .events_ingested
            .with_label_values(&["state_change"])
            .inc();
        self.push_source(event).await
    }
}
