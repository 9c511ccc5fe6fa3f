use crate::config::ApiConfig;
use crate::handler::{ErrorBody, InvocationResponse, QrCodeHandler, QrCodeRequest, ResponseBody};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<QrCodeHandler>,
}

impl IntoResponse for InvocationResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

fn invalid_body(rejection: JsonRejection) -> InvocationResponse {
    warn!(error = %rejection, "Rejected malformed request body");
    metrics::counter!("qrcode.requests.rejected").increment(1);
    InvocationResponse {
        status_code: 400,
        body: ResponseBody::Error(ErrorBody {
            message: "Invalid request body".to_string(),
            error: None,
        }),
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/qrcodes", post(create_qrcode))
        .route("/invoke", post(invoke))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "qrcode-service"
    }))
}

/// Generate a QR code, replying with the invocation status and body
#[instrument(skip_all)]
async fn create_qrcode(
    State(state): State<AppState>,
    payload: Result<Json<QrCodeRequest>, JsonRejection>,
) -> InvocationResponse {
    match payload {
        Ok(Json(request)) => state.handler.handle(request).await,
        Err(rejection) => invalid_body(rejection),
    }
}

/// Generate a QR code, replying with a `{statusCode, body}` envelope
#[instrument(skip_all)]
async fn invoke(
    State(state): State<AppState>,
    payload: Result<Json<QrCodeRequest>, JsonRejection>,
) -> Response {
    let response = match payload {
        Ok(Json(request)) => state.handler.handle(request).await,
        Err(rejection) => invalid_body(rejection),
    };

    match response.into_envelope() {
        Ok(envelope) => Json(envelope).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to serialize invocation envelope");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Start the invocation API server, stopping when `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting QR code API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
