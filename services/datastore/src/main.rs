use anyhow::{Context, Result};
#[cfg(feature = "grpc")]
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use historical_datastore::api::{self, auth::TokenValidator, AppState};
use historical_datastore::config::{Config, DataBackendConfig, RegistryBackendConfig};
use historical_datastore::data::{DataController, DataStorage, SenmlStore, SqliteStorage};
use historical_datastore::mqtt::{MqttConnector, RumqttConnector};
use historical_datastore::registry::{
    embedded::RedbBackend, memory::MemoryBackend, EventListener, RegistryController,
    RegistryStorage, StreamBackend,
};
use historical_datastore::{init_metrics, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.logging);

    info!(
        service_id = %config.service_id,
        api_version = %config.api_version,
        "Starting Historical Datastore"
    );

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    // Storage backends
    let registry_backend =
        open_registry_backend(&config.registry.backend).context("Failed to open registry")?;
    let (data_storage, data_listener) = open_data_storage(&config.data.backend)
        .await
        .context("Failed to open data storage")?;

    let registry_storage = Arc::new(RegistryStorage::new(registry_backend));
    registry_storage.add_listener(data_listener);
    let registry = Arc::new(RegistryController::new(registry_storage.clone()));
    let data = Arc::new(DataController::new(
        registry.clone(),
        data_storage.clone(),
        config.data.auto_registration,
    ));

    // MQTT connector
    let connector = Arc::new(
        MqttConnector::new(
            &config.service_id,
            Arc::new(RumqttConnector),
            data_storage.clone(),
        )
        .with_feed(data.feed()),
    );
    registry_storage.add_listener(connector.clone());
    connector
        .start(&registry)
        .await
        .context("Failed to start MQTT connector")?;

    let shutdown = CancellationToken::new();

    // gRPC server
    #[cfg(feature = "grpc")]
    let grpc_handle = if config.grpc.enabled {
        let addr: SocketAddr = format!("{}:{}", config.grpc.bind_addr, config.grpc.bind_port)
            .parse()
            .context("Invalid gRPC bind address")?;
        let (registry, data, pki) = (registry.clone(), data.clone(), config.pki.clone());
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            let stopped = token.cancelled_owned();
            if let Err(e) =
                historical_datastore::grpc::serve(addr, registry, data, &pki, stopped).await
            {
                error!(error = %e, "gRPC server error");
            }
        }))
    } else {
        None
    };
    #[cfg(not(feature = "grpc"))]
    {
        if config.grpc.enabled {
            tracing::warn!("gRPC is enabled in the configuration but this build has no gRPC support");
        }
    }

    // HTTP server
    let validator = config.auth.enabled.then(|| {
        Arc::new(TokenValidator::new(&config.auth)) as Arc<dyn api::auth::RequestValidator>
    });
    let router = api::create_router(
        AppState::new(registry.clone(), data.clone(), &config.api_version),
        validator,
    );
    let addr = format!("{}:{}", config.http.bind_addr, config.http.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    info!(address = %addr, public_endpoint = %config.http.public_endpoint, "HTTP server listening");

    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server error")?;

    info!("Shutting down Historical Datastore");

    #[cfg(feature = "grpc")]
    {
        if let Some(handle) = grpc_handle {
            let _ = handle.await;
        }
    }

    connector.stop().await;
    data_storage.close().await;

    info!("Historical Datastore stopped");
    Ok(())
}

fn open_registry_backend(config: &RegistryBackendConfig) -> Result<Arc<dyn StreamBackend>> {
    match config.backend_type.as_str() {
        "redb" | "leveldb" => {
            let backend = RedbBackend::open(&config.dsn)?;
            info!(path = %backend.path().display(), "Opened persistent registry");
            Ok(Arc::new(backend))
        }
        _ => {
            info!("Using in-memory registry");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

async fn open_data_storage(
    config: &DataBackendConfig,
) -> Result<(Arc<dyn DataStorage>, Arc<dyn EventListener>)> {
    match config.backend_type.as_str() {
        "senmlstore" => {
            let storage = Arc::new(SenmlStore::open(&config.dsn)?);
            info!(path = %config.dsn, "Opened senmlstore data storage");
            Ok((
                storage.clone() as Arc<dyn DataStorage>,
                storage as Arc<dyn EventListener>,
            ))
        }
        _ => {
            let storage = Arc::new(SqliteStorage::connect(&config.dsn).await?);
            info!(dsn = %config.dsn, "Opened SQLite data storage");
            Ok((
                storage.clone() as Arc<dyn DataStorage>,
                storage as Arc<dyn EventListener>,
            ))
        }
    }
}
