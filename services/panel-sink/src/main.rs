use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use panel_sink::http_api::{start_http_server, AppState};
use panel_sink::{
    ensure_bucket, Config, LoggingErrorSink, ObjectStore, S3ObjectStore, StreamRuntime,
    StreamSecurity, UploadPipeline,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
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
        "Starting Grafana panel sink"
    );

    let metrics_handle = init_metrics()?;

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3).await);

    // Every upload depends on the bucket, so a failure here ends startup
    ensure_bucket(store.as_ref(), &config.s3.bucket)
        .await
        .context("Failed to bootstrap panel bucket")?;

    let security = StreamSecurity::select(&config.kafka);
    let pipeline = Arc::new(UploadPipeline::new(store, config.s3.bucket.clone()));

    let mut runtime = StreamRuntime::new(
        config.kafka.clone(),
        security,
        pipeline,
        Arc::new(LoggingErrorSink),
    );
    runtime.start().context("Failed to start stream runtime")?;

    let api_state = AppState {
        runtime: runtime.status(),
        metrics: metrics_handle,
    };

    let (http_shutdown_tx, mut http_shutdown_rx) = broadcast::channel::<()>(1);
    let http_port = config.service.http_port;
    let api_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = http_shutdown_rx.recv().await;
        };
        if let Err(e) = start_http_server(api_state, http_port, shutdown).await {
            error!(error = %e, "HTTP server error");
        }
    });

    info!("Grafana panel sink started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down Grafana panel sink");

    let _ = http_shutdown_tx.send(());

    let grace = config.shutdown_grace();
    if tokio::time::timeout(grace, runtime.stop()).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "Stream runtime did not stop in time, aborting workers");
        runtime.abort();
    }

    if tokio::time::timeout(grace, api_handle).await.is_err() {
        warn!("HTTP server did not stop in time");
    }

    info!("Grafana panel sink stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Install the Prometheus recorder behind the /metrics endpoint
fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    info!("Prometheus recorder installed");

    Ok(handle)
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
