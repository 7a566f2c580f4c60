//! Process-wide lifecycle coordinator.
//!
//! Startup wires the components in dependency order: configuration (already
//! validated), metadata store, time-series client (advisory reachability
//! probe only; the writer's retry handles a store that is down at boot),
//! batch writer and metadata synchronizer, event router, enrichment
//! workers, and finally the source connector.
//!
//! Shutdown runs in reverse off one cancellation token: the connector and
//! enrichment workers stop producing, the intake queue closes and drains
//! through the router, the writer performs its final flush, the
//! synchronizer commits pending upserts, and a hard deadline forces
//! termination if any drain hangs.
//!
//! Panic policy: the connector and enrichment workers are restarted in
//! place; a batch-writer or synchronizer panic is treated as fatal and
//! aborts the process with a non-zero exit.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ha_ingest_connector::{ConnectorStatus, HaConnector};
use ha_ingest_core::config::IngestConfig;
use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::EventSink;
use ha_ingest_core::metrics::PipelineMetrics;
use ha_ingest_pipeline::enrichment::{
    EnrichmentScheduler, EnrichmentWorker, PowerCorrelationWorker, WeatherWorker,
};
use ha_ingest_pipeline::intake::IntakeQueue;
use ha_ingest_pipeline::metadata::{MetadataStore, MetadataSynchronizer};
use ha_ingest_pipeline::router::EventRouter;
use ha_ingest_pipeline::tsdb::TsdbClient;
use ha_ingest_pipeline::writer::BatchWriter;

use crate::health::{self, HealthState};

/// How the process came down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All drains completed inside the deadline.
    Clean,
    /// The deadline expired and remaining tasks were abandoned.
    Forced,
}

pub struct PipelineSupervisor {
    config: IngestConfig,
}

impl PipelineSupervisor {
    pub fn new(config: IngestConfig) -> Self {
        PipelineSupervisor { config }
    }

    pub async fn run(self) -> IngestResult<ShutdownOutcome> {
        let config = self.config;
        let metrics = Arc::new(PipelineMetrics::new().map_err(|e| {
            IngestError::configuration(format!("cannot build metrics registry: {}", e))
        })?);

        // Stores first: the metadata store must open (schema creation is
        // part of startup), the time-series store only gets a probe.
        let store = MetadataStore::open(&config.metadata)?;
        let tsdb = TsdbClient::new(&config.tsdb)?;
        if !tsdb.ping().await {
            warn!("time-series store unreachable at startup; writes will retry");
        }

        let shutdown = CancellationToken::new();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<IngestError>(8);

        // Write side.
        let (writer, writer_handle) = BatchWriter::channel(
            config.tsdb.clone(),
            tsdb,
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let writer_task = spawn_critical("batch_writer", writer.run(), fatal_tx.clone());

        let (synchronizer, metadata_handle) = MetadataSynchronizer::channel(
            store,
            config.metadata.coalesce_window,
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let sync_task = spawn_critical(
            "metadata_synchronizer",
            synchronizer.run(),
            fatal_tx.clone(),
        );

        // Routing core.
        let intake = IntakeQueue::new(
            config.router.intake_capacity,
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let router = EventRouter::new(
            &config.router,
            Arc::clone(&intake),
            writer_handle,
            metadata_handle,
            Arc::clone(&metrics),
        );
        let router_task = spawn_critical("event_router", router.run(), fatal_tx.clone());

        // Enrichment workers, each restarted in place if it panics.
        let scheduler = EnrichmentScheduler::new(
            Arc::clone(&intake),
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        let mut enrichment_tasks = Vec::new();
        if let Some(weather_config) = config.enrichment.weather.clone() {
            let worker: Arc<dyn EnrichmentWorker> = Arc::new(WeatherWorker::new(weather_config)?);
            enrichment_tasks.push(spawn_restarting(&scheduler, worker, shutdown.clone()));
        }
        if let Some(power_config) = config.enrichment.power.clone() {
            let worker: Arc<dyn EnrichmentWorker> =
                Arc::new(PowerCorrelationWorker::new(power_config)?);
            enrichment_tasks.push(spawn_restarting(&scheduler, worker, shutdown.clone()));
        }

        // Source connector, last: everything downstream is ready for its
        // events. Restarted in place on panic; fatal on credential errors.
        let connector_status = Arc::new(ConnectorStatus::new());
        let connector_task = spawn_critical(
            "ha_connector",
            run_connector_restarting(
                config.ha.clone(),
                Arc::clone(&intake) as Arc<dyn EventSink>,
                Arc::clone(&metrics),
                Arc::clone(&connector_status),
                shutdown.clone(),
            ),
            fatal_tx.clone(),
        );
        drop(fatal_tx);

        let health_handle = health::spawn(
            config.supervisor.health_port,
            HealthState {
                connector: Arc::clone(&connector_status),
                metrics: Arc::clone(&metrics),
                flush_staleness: config.tsdb.flush_interval * 2,
                started_at: Utc::now(),
            },
        )?;

        info!("pipeline running");

        // Wait for a shutdown signal or the first fatal component error.
        let fatal: Option<IngestError> = tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                None
            }
            maybe_err = fatal_rx.recv() => maybe_err,
        };

        // Reverse-order drain: stop producers, close intake, let the
        // writers finish.
        shutdown.cancel();
        intake.close();

        let drain = async {
            let _ = connector_task.await;
            for task in enrichment_tasks {
                let _ = task.await;
            }
            let _ = router_task.await;
            let _ = writer_task.await;
            let _ = sync_task.await;
        };
        let outcome = match timeout(config.supervisor.shutdown_deadline, drain).await {
            Ok(()) => {
                info!("pipeline drained");
                ShutdownOutcome::Clean
            }
            Err(_) => {
                error!(
                    deadline_s = config.supervisor.shutdown_deadline.as_secs(),
                    "shutdown deadline exceeded, forcing termination"
                );
                ShutdownOutcome::Forced
            }
        };

        health_handle.stop(false).await;

        match fatal {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }
}

/// Spawn a component whose failure or panic must bring the process down.
/// The inner future runs on its own task so a panic is caught as a join
/// error and reported on the fatal channel.
fn spawn_critical<F>(
    name: &'static str,
    fut: F,
    fatal_tx: mpsc::Sender<IngestError>,
) -> JoinHandle<()>
where
    F: Future<Output = IngestResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let inner = tokio::spawn(fut);
        match inner.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(component = name, error = %err, "component failed");
                let _ = fatal_tx.send(err).await;
            }
            Err(join_err) => {
                error!(component = name, error = %join_err, "component panicked");
                let _ = fatal_tx
                    .send(IngestError::persistence_permanent(
                        name,
                        format!("task panicked: {}", join_err),
                    ))
                    .await;
            }
        }
    })
}

/// Run the connector, restarting it whenever it panics; credential
/// failures and clean stops end the loop.
async fn run_connector_restarting(
    config: ha_ingest_core::config::HaConfig,
    sink: Arc<dyn EventSink>,
    metrics: Arc<PipelineMetrics>,
    status: Arc<ConnectorStatus>,
    shutdown: CancellationToken,
) -> IngestResult<()> {
    loop {
        let connector = HaConnector::new(
            config.clone(),
            Arc::clone(&sink),
            Arc::clone(&metrics),
            Arc::clone(&status),
            shutdown.clone(),
        );
        match tokio::spawn(connector.run()).await {
            Ok(result) => return result,
            Err(join_err) => {
                error!(error = %join_err, "source connector panicked, restarting");
                if shutdown.is_cancelled() {
                    return Ok(());
                }
            }
        }
    }
}

/// Spawn one enrichment worker, restarting it in place if it panics. A
/// stuck or failing worker never affects its siblings.
fn spawn_restarting(
    scheduler: &EnrichmentScheduler,
    worker: Arc<dyn EnrichmentWorker>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move {
        let mut handle = scheduler.spawn(Arc::clone(&worker));
        loop {
            match handle.await {
                Ok(()) => return,
                Err(join_err) => {
                    error!(kind = worker.kind(), error = %join_err, "enrichment worker panicked, restarting");
                    if shutdown.is_cancelled() {
                        return;
                    }
                    handle = scheduler.spawn(Arc::clone(&worker));
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
