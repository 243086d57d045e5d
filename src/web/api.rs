use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use super::AppState;
use crate::engine::{IngestOutcome, WebhookPayload};
use crate::error::StoreError;

/// `StoreError` as an HTTP response: `{"status":"error","kind":..,"message":..}`.
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            StoreError::MalformedId(_) => StatusCode::BAD_REQUEST,
            StoreError::UnknownStrategy(_) => StatusCode::NOT_FOUND,
            StoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StoreError::StorageWriteFailure(_) | StoreError::StorageUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StoreError::ConcurrencyConflict(_) | StoreError::OutOfOrder { .. } => StatusCode::CONFLICT,
            StoreError::InvalidEvent(_) | StoreError::Replay(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }

        let mut response = (
            status,
            Json(json!({
                "status": "error",
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            })),
        )
            .into_response();

        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

// === Ingestion ===

pub async fn post_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let strategy_id = payload.strategy_id.trim().to_string();
    let outcome = state.ingestor.handle(&payload).await?;

    let body = match outcome {
        IngestOutcome::Recorded { record } => json!({
            "status": "ok",
            "strategy_id": strategy_id,
            "event": record.event,
        }),
        IngestOutcome::Reset { base_id, superseded } => json!({
            "status": "ok",
            "strategy_id": base_id,
            "event": "reset",
            "superseded": superseded,
        }),
    };
    Ok(Json(body))
}

// === Dashboard data ===

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub strategy: Option<String>,
}

pub async fn get_snapshot(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = match query.strategy.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(base_id) => state.facade.snapshot_for(base_id).await?,
        None => state.facade.snapshot().await,
    };
    Ok(Json(snapshot))
}

pub async fn get_strategies(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "strategies": state.facade.base_ids().await
    }))
}

// === Reset ===

#[derive(Deserialize)]
pub struct ResetRequest {
    pub strategy_id: String,
    #[serde(default)]
    pub secret: String,
}

pub async fn post_reset(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let base_id = request.strategy_id.trim();
    let superseded = state.controller.submit_reset(base_id, &request.secret).await?;
    Ok(Json(json!({
        "status": "ok",
        "strategy_id": base_id,
        "superseded": superseded,
    })))
}

// === Export ===

pub async fn download_log(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let document = state.store.export_log().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"log.json\""),
        ],
        document,
    ))
}

// === Notifications ===

pub async fn get_notifications(State(state): State<AppState>) -> impl IntoResponse {
    let recent = state.notifications.get_recent(50).await;
    Json(json!({
        "notifications": recent
    }))
}

/// LINE self-test: pushes a fixed message with the configured credentials.
pub async fn test_line(State(state): State<AppState>) -> Response {
    match state.notifications.send_test().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => {
            warn!("LINE test push failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "error",
                    "kind": "notification_failure",
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

// === Health ===

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    writable: bool,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let writable = state.store.is_writable();
    if !writable {
        warn!("Health check: event store is refusing writes");
    }
    Json(HealthResponse {
        status: if writable { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        writable,
    })
}
