//! Axum-based HTTP boundary.
//!
//! # Endpoints
//!
//! | Method | Path             | Description                                  |
//! |--------|------------------|----------------------------------------------|
//! | `GET`  | `/`              | Liveness banner with the loaded model name.  |
//! | `GET`  | `/health`        | Health details.                              |
//! | `POST` | `/predict`       | Score one patient record.                    |
//! | `POST` | `/predict/batch` | Score `{"patients": [...]}` in one call.     |
//!
//! The model is loaded before the listener is bound, so a running server always
//! has a model.

use crate::config::ServeConfig;
use crate::inference::{BATCH_FIELD, BatchPrediction, PredictionError, PredictionResult, Predictor};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state injected into every handler via the [`State`] extractor.
#[derive(Clone)]
pub struct AppState {
    predictor: Predictor,
    max_batch_size: Option<usize>,
    model_name: Arc<str>,
}

impl AppState {
    pub fn new(predictor: Predictor, max_batch_size: Option<usize>) -> Self {
        let model = predictor.model();
        let model_name = model
            .description
            .clone()
            .unwrap_or_else(|| model.summary());
        Self {
            predictor,
            max_batch_size,
            model_name: model_name.into(),
        }
    }
}

/// An error rendered as `{"detail": ...}` with an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<PredictionError> for ApiError {
    fn from(err: PredictionError) -> Self {
        let status = if !err.is_client_error() {
            log::error!("{err}");
            StatusCode::INTERNAL_SERVER_ERROR
        } else if matches!(err, PredictionError::EmptyBatch) {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

/// Builds the router with all routes wired to `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .with_state(state)
}

/// Binds the configured address and serves until Ctrl-C.
pub async fn serve(predictor: Predictor, config: &ServeConfig) -> std::io::Result<()> {
    let app = router(AppState::new(predictor, config.max_batch_size));
    let listener = tokio::net::TcpListener::bind(config.socket_addr()).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to install Ctrl-C handler: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "Diabetes Prediction API is running!",
        "status": "healthy",
        "model": &*state.model_name,
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "model_loaded": true,
        "api_version": API_VERSION,
    }))
}

async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let Json(payload) = payload?;
    let result = state.predictor.predict_json(&payload)?;
    Ok(Json(result))
}

async fn predict_batch(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<BatchPrediction>, ApiError> {
    let Json(payload) = payload?;

    if let (Some(max), Some(len)) = (
        state.max_batch_size,
        payload
            .get(BATCH_FIELD)
            .and_then(Value::as_array)
            .map(Vec::len),
    ) {
        if len > max {
            return Err(ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Batch of {len} records exceeds the limit of {max}."),
            ));
        }
    }

    // Large batches are CPU-bound; keep them off the async workers.
    let predictor = state.predictor.clone();
    let result = tokio::task::spawn_blocking(move || predictor.predict_batch_json(&payload))
        .await
        .map_err(|e| {
            log::error!("Batch scoring task failed: {e}");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Batch scoring task failed.")
        })??;
    Ok(Json(result))
}
