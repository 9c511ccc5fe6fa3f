use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use qrcode_service::config::{AwsConfig, Config};
use qrcode_service::{
    start_api_server, AppState, DynamoMetadataStore, QrCodeHandler, QrPngEncoder, S3ObjectStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting QR code service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Clients are built once and shared by every request
    let sdk_config = load_aws_config(&config.aws).await;
    let object_store = Arc::new(S3ObjectStore::new(&sdk_config, &config.s3));
    let metadata_store = Arc::new(DynamoMetadataStore::new(&sdk_config, &config.dynamodb));
    let encoder = Arc::new(QrPngEncoder::new(&config.encoder));

    let handler = QrCodeHandler::new(
        encoder,
        object_store,
        metadata_store,
        config.s3.key_prefix.clone(),
        config.presigned_url_expiry(),
    );

    let api_state = AppState {
        handler: Arc::new(handler),
    };

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("QR code service stopped");

    Ok(())
}

/// JSON logs; `RUST_LOG` takes precedence over `service.log_level`
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_current_span(true))
        .init();
}

/// Serve the `qrcode.*` counters and histograms on `/metrics`
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Metrics listener started");

    Ok(())
}

/// Load the AWS SDK configuration shared by the S3 and DynamoDB clients
async fn load_aws_config(config: &AwsConfig) -> aws_types::SdkConfig {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;

    info!(region = %config.region, "AWS configuration loaded");

    sdk_config
}

/// Resolves on SIGINT or SIGTERM; in-flight requests are allowed to finish
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl+C; relying on SIGTERM");
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
                warn!(error = %e, "Cannot listen for SIGTERM; relying on Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal_name = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };

    info!(signal = signal_name, "Draining QR code API before exit");
}
