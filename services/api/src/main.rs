use anyhow::{Context, Result};
use imagepoet_api::{
    start_api_server, AppState, Config, GenerationTask, LocalStore, ObjectStore,
    OpenAiPoetClient, PoemGenerator, RecordStore, S3ObjectStore, UploadService,
};
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
        environment = %config.service.environment,
        "Starting Image Poet API"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let records = RecordStore::connect(&config.database)
        .await
        .context("Failed to initialize record store")?;

    if config.database.run_migrations {
        records
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let local = LocalStore::new(&config.storage.upload_dir)
        .await
        .context("Failed to initialize upload directory")?;

    let objects: Option<Arc<dyn ObjectStore>> = if config.s3_enabled() {
        S3ObjectStore::new(&config.s3)
            .await
            .map(|store| Arc::new(store) as Arc<dyn ObjectStore>)
    } else {
        if config.storage.use_s3 {
            warn!("S3 storage requested but no bucket configured, using local storage");
        }
        None
    };

    let uploads = Arc::new(UploadService::new(
        local,
        objects,
        records.clone(),
        config.storage.max_file_size_bytes,
        config.s3.key_prefix.clone(),
    ));

    let generator: Option<Arc<dyn PoemGenerator>> =
        match OpenAiPoetClient::new(&config.generation) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(error = %e, "Poetry generation unavailable");
                None
            }
        };

    let generation = GenerationTask::new(
        records.clone(),
        uploads.clone(),
        generator,
        config.retry_policy(),
    );

    let config = Arc::new(config);

    // Create API state
    let api_state = AppState {
        records,
        uploads,
        generation,
        config: config.clone(),
    };

    // Spawn API server task
    let api_config = config.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = ?e, "API server error");
        }
    });

    info!("Image Poet API started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down Image Poet API");

    api_handle.abort();

    info!("Image Poet API stopped");

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
