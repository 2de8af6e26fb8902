use anyhow::{Context, Result};
use recognition_service::api::{start_api_server, AppState};
use recognition_service::blob_store::{BlobStore, S3BlobStore};
use recognition_service::config::Config;
use recognition_service::object_detector::DetectorHandle;
use recognition_service::orchestrator::IngestionOrchestrator;
use recognition_service::record_store::PgRecordStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Recognition Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let record_store = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    if config.database.run_migrations {
        record_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize blob store")?,
    );

    // Uploads fail until the bucket exists; the health check reports it
    if let Err(e) = blob_store.ensure_container().await {
        error!(error = %e, bucket = %blob_store.bucket(), "Failed to ensure bucket exists");
    }

    let detector = match DetectorHandle::init(&config.detector).await {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            warn!(error = %e, "Failed to initialize object detector, detection disabled");
            Arc::new(DetectorHandle::disabled())
        }
    };

    let orchestrator = Arc::new(IngestionOrchestrator::new(
        blob_store,
        record_store,
        detector.clone(),
    ));

    let api_state = AppState {
        orchestrator,
        max_list_limit: config.api.max_list_limit,
    };

    info!("Recognition service started successfully");

    if let Err(e) = start_api_server(api_state, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
    }

    info!("Shutting down recognition service");

    detector.shutdown();

    info!("Recognition service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
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
