//! Liveness, readiness and metrics endpoints.
//!
//! `/health` answers 200 for as long as the supervisor runs. `/ready` is
//! advisory: 200 when the connector is streaming and the last successful
//! flush is recent, 503 otherwise. The pipeline keeps operating either way.
//! `/metrics` serves the prometheus text encoding of the shared registry.
//!
//! The server runs on its own OS thread with a single-threaded actix system
//! so the pipeline runtime never competes with HTTP handling.

use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use ha_ingest_connector::ConnectorStatus;
use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::metrics::PipelineMetrics;

/// Read-only view the endpoints render.
pub struct HealthState {
    pub connector: Arc<ConnectorStatus>,
    pub metrics: Arc<PipelineMetrics>,
    /// Readiness tolerates flushes up to this old (2x the flush interval).
    pub flush_staleness: Duration,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct LivenessBody {
    status: &'static str,
    version: &'static str,
    uptime_seconds: i64,
    connector_state: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    ready: bool,
    connector_state: &'static str,
    last_flush_age_seconds: Option<i64>,
}

impl HealthState {
    /// Streaming, and either a fresh flush or nothing has needed flushing
    /// yet.
    pub fn is_ready(&self) -> (bool, Option<i64>) {
        let streaming = self.connector.is_streaming();
        let last_flush = self.metrics.writer.last_flush_timestamp.get();
        if last_flush <= 0.0 {
            let nothing_flushed_yet = self.metrics.writer.batches_flushed.get() == 0
                && self.metrics.writer.retry_buffer_depth.get() == 0;
            return (streaming && nothing_flushed_yet, None);
        }
        let age = Utc::now().timestamp() - last_flush as i64;
        (
            streaming && age <= self.flush_staleness.as_secs() as i64,
            Some(age),
        )
    }
}

async fn health(state: web::Data<HealthState>) -> HttpResponse {
    HttpResponse::Ok().json(LivenessBody {
        status: "alive",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        connector_state: state.connector.state().as_str(),
    })
}

async fn ready(state: web::Data<HealthState>) -> HttpResponse {
    let (ready, last_flush_age_seconds) = state.is_ready();
    let body = ReadinessBody {
        ready,
        connector_state: state.connector.state().as_str(),
        last_flush_age_seconds,
    };
    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn metrics_text(state: web::Data<HealthState>) -> HttpResponse {
    match state.metrics.encode_text() {
        Ok(text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(text),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

/// Start the health server on a dedicated thread; returns once the port is
/// bound so startup failures stay fail-fast.
pub fn spawn(port: u16, state: HealthState) -> IngestResult<ServerHandle> {
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::Builder::new()
        .name("health-server".to_string())
        .spawn(move || {
            let system = actix_web::rt::System::new();
            system.block_on(async move {
                let data = web::Data::new(state);
                let bound = HttpServer::new(move || {
                    App::new()
                        .app_data(data.clone())
                        .route("/health", web::get().to(health))
                        .route("/ready", web::get().to(ready))
                        .route("/metrics", web::get().to(metrics_text))
                })
                .workers(1)
                .bind(("0.0.0.0", port));

                match bound {
                    Ok(server) => {
                        let server = server.run();
                        let _ = tx.send(Ok(server.handle()));
                        let _ = server.await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(IngestError::configuration(format!(
                            "cannot bind health port {}: {}",
                            port, e
                        ))));
                    }
                }
            });
        })
        .map_err(|e| {
            IngestError::configuration(format!("cannot start health server thread: {}", e))
        })?;

    let handle = rx
        .recv()
        .map_err(|_| IngestError::configuration("health server thread exited before binding"))??;
    info!(port, "health server listening");
    Ok(handle)
}
