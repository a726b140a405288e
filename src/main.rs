//! Service entrypoint: configuration, telemetry, the job runner and the API
//! server, with coordinated graceful shutdown.

use anyhow::{Context, Result};
use coffer::api::{self, AppState};
use coffer::blob_store::BlobStore;
use coffer::config::Config;
use coffer::job_queue::JobRunner;
use coffer::metadata_store::MetadataStore;
use coffer::service::StorageService;
use coffer::workers::{
    BucketDeletionWorker, BucketEmptyingWorker, ObjectDeletionWorker, UploadSessionExpiryWorker,
    Workers,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config)?;
    init_metrics(&config)?;

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Starting coffer"
    );

    let meta = Arc::new(
        MetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );
    if config.database.run_migrations {
        meta.run_migrations().await?;
    }

    let blobs = Arc::new(
        BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize blob store")?,
    );

    let service = Arc::new(StorageService::new(
        meta.clone(),
        blobs.clone(),
        config.presign.clone(),
    ));

    if !config.default_buckets.is_empty() {
        if let Err(e) = service.bootstrap_default_buckets(&config.default_buckets).await {
            error!(error = %e, "Default bucket bootstrap failed");
        }
    }

    let workers = Arc::new(Workers::new(meta.clone(), blobs.clone()));
    let mut runner = JobRunner::new(meta.pool().clone(), config.jobs.clone());
    runner.register(Arc::new(BucketDeletionWorker(workers.clone())))?;
    runner.register(Arc::new(BucketEmptyingWorker(workers.clone())))?;
    runner.register(Arc::new(ObjectDeletionWorker(workers.clone())))?;
    runner.register(Arc::new(UploadSessionExpiryWorker(workers)))?;

    let shutdown = CancellationToken::new();

    let runner_token = shutdown.clone();
    let runner_handle = tokio::spawn(async move {
        runner.run(runner_token).await;
    });

    let state = AppState {
        service,
        pool: meta.pool().clone(),
        api_key: Arc::new(config.service.api_key.clone()),
    };
    let router = api::create_router(state, &config.service);

    let server_token = shutdown.clone();
    let server = tokio::spawn(async move {
        api::serve(
            router,
            &config.service.host,
            config.service.port,
            server_token,
        )
        .await
    });

    shutdown_signal().await;
    info!("Shutdown signal received, draining");
    shutdown.cancel();

    if let Err(e) = server.await.context("API server task panicked")? {
        error!(error = %e, "API server exited with error");
    }
    runner_handle.await.context("Job runner task panicked")?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));

    if config.service.environment == "dev" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
    Ok(())
}

fn init_metrics(config: &Config) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", config.service.metrics_port)
        .parse()
        .context("Invalid metrics address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(port = config.service.metrics_port, "Metrics exporter started");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
