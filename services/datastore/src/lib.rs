//! Historical Datastore
//!
//! Time-series store for SenML sensor data. Streams are registered in a
//! registry that carries their type, unit, metadata and optional ingestion
//! source. Records arrive over HTTP, gRPC or from MQTT brokers and are kept in
//! a per-stream table of the data backend.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP / gRPC ──▶ Registry Controller ──events──▶ Data Storage
//!       │                                   └────▶ MQTT Connector ◀── brokers
//!       ▼                                                │
//!  Data Controller ──────────▶ Data Storage ◀────────────┘
//!       │                                                │
//!       └──────────────▶ live feed ◀─────────────────────┘
//! ```
//!
//! Registry changes fan out to every [`registry::EventListener`]: the data
//! backend creates and drops stream tables, the MQTT connector moves its
//! subscriptions.

pub mod api;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod mqtt;
pub mod pagination;
pub mod registry;
pub mod senml;

pub use config::Config;
pub use error::{Error, Result};

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::LoggingConfig;

/// Initialize tracing; `RUST_LOG` overrides the configured level
pub fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize the Prometheus metrics exporter
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    use anyhow::Context;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
