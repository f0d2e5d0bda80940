use anyhow::{Context, Result};
use enrichment_service::config::Config;
use enrichment_service::{
    start_api_server, AppState, EnrichmentPipeline, NotificationKafkaConsumer, OcrStage,
    PgRecordStore, RecordStore, S3ObjectStore, TextExtractor, TextractExtractor,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
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
        "Starting Image Enrichment Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
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

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    if let Some(ref bucket) = config.s3.upload_bucket {
        if let Err(e) = object_store.ping_bucket(bucket).await {
            warn!(bucket = %bucket, error = %e, "Upload bucket is not reachable");
        }
    }

    let extractor: Option<Arc<dyn TextExtractor>> = if config.ocr.enabled {
        let textract: Arc<dyn TextExtractor> = Arc::new(
            TextractExtractor::new(&config.s3.region)
                .await
                .context("Failed to initialize Textract client")?,
        );
        Some(textract)
    } else {
        info!("Text extraction disabled");
        None
    };

    let record_store: Arc<dyn RecordStore> = record_store;

    let pipeline = Arc::new(EnrichmentPipeline::new(
        object_store.clone(),
        record_store.clone(),
        OcrStage::new(extractor, config.ocr.clone()),
        config.pipeline.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Spawn Kafka consumer task when a topic is configured
    let consumer_handle = match config.kafka {
        Some(ref kafka_config) => {
            let consumer = NotificationKafkaConsumer::new(kafka_config, pipeline.clone())
                .context("Failed to initialize Kafka consumer")?;
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                let result = consumer.run(token.clone()).await;
                if result.is_err() {
                    // Exit so the restarted process resumes from the committed offset
                    token.cancel();
                }
                result
            }))
        }
        None => {
            info!("Kafka not configured, accepting notifications over HTTP only");
            None
        }
    };

    // Create API state
    let api_state = AppState {
        pipeline,
        record_store,
        link_signer: object_store,
        upload_bucket: config.s3.upload_bucket.clone(),
        presigned_url_expiry: config.presigned_url_expiry(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let token = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, token).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Enrichment service started successfully");

    // Wait for shutdown signal or a failed consumer
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            warn!("Kafka consumer stopped unexpectedly");
        }
    }

    info!("Shutting down enrichment service");

    // Let in-flight batches finish before leaving
    shutdown.cancel();
    let consumer_result = match consumer_handle {
        Some(handle) => handle.await.context("Kafka consumer task panicked")?,
        None => Ok(()),
    };
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task panicked");
    }

    info!("Enrichment service stopped");

    consumer_result.context("Kafka consumer failed")
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
