// Reelflow server
// Runs the engine, the worker pool and the HTTP API in one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use reelflow_durable::InMemoryWorkflowEventStore;
use reelflow_pipeline::telemetry::{init_telemetry, TelemetryConfig};
use reelflow_pipeline::{http, LoggingNotifier, MockVideoProcessor, PipelineConfig, VideoPipeline};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_SERVICE_NAME: Service name (default: "reelflow")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("reelflow=debug,reelflow_pipeline=debug,reelflow_durable=info,tower_http=debug".to_string());
    }
    telemetry_config.service_version = Some(env!("CARGO_PKG_VERSION").to_string());

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = PipelineConfig::from_env();
    tracing::info!(
        bind_address = %config.bind_address,
        public_base_url = %config.public_base_url,
        approval_timeout_secs = config.approval_timeout.as_secs(),
        worker_concurrency = config.worker_concurrency,
        "reelflow starting..."
    );

    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let pipeline = Arc::new(VideoPipeline::new(
        store,
        config.clone(),
        Arc::new(MockVideoProcessor::new(config.mock_work)),
        Arc::new(LoggingNotifier),
    ));

    let report = pipeline
        .recover()
        .await
        .context("Failed to recover workflows")?;
    tracing::info!(?report, "recovery finished");

    pipeline.start().context("Failed to start worker pool")?;

    // Only needed when a UI is served from a different origin
    let cors_origins: Vec<HeaderValue> = std::env::var("CORS_ALLOWED_ORIGINS")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default();

    let app = http::routes(pipeline.clone());
    let app = if cors_origins.is_empty() {
        app
    } else {
        tracing::info!(origins = ?cors_origins, "CORS origins configured");
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]),
        )
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", config.bind_address);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal");
        signal.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Server error")?;

    pipeline
        .shutdown()
        .await
        .context("Failed to drain worker pool")?;
    tracing::info!("reelflow shutdown complete");
    Ok(())
}
