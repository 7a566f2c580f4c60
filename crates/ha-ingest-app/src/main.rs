//! `ha-ingest`: the Home Assistant telemetry ingestion pipeline binary.
//!
//! Exit codes: 0 on clean shutdown, 2 on configuration errors at startup,
//! 1 on unrecoverable component faults or a forced shutdown.

mod health;
mod supervisor;

use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ha_ingest_core::config::{IngestConfig, LogFormat};
use ha_ingest_core::error::IngestError;

use crate::supervisor::{PipelineSupervisor, ShutdownOutcome};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(2);
        }
    };
    init_tracing(config.supervisor.log_format);
    info!(version = env!("CARGO_PKG_VERSION"), "starting ha-ingest");

    match PipelineSupervisor::new(config).run().await {
        Ok(ShutdownOutcome::Clean) => {
            info!("clean shutdown");
        }
        Ok(ShutdownOutcome::Forced) => {
            eprintln!("shutdown deadline exceeded; remaining tasks were aborted");
            std::process::exit(1);
        }
        Err(err @ IngestError::Configuration { .. }) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("fatal pipeline error: {}", err);
            std::process::exit(1);
        }
    }
}
