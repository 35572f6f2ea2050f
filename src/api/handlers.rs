//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
};
use tracing::error;
use utoipa::OpenApi;

use crate::app::AppState;
use crate::domain::{
    AdmissionError, AppError, BlockchainError, DatabaseError, DispatchError, ErrorDetail,
    ErrorResponse, ForwardRequest, ForwardResponse, HealthResponse, HealthStatus, QueueState,
    RateLimitResponse, StatusResponse, ValidationError,
};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Meta-Transaction Relayer API",
        version = "0.1.0",
        description = "API for relaying pre-signed ERC-20 meta-transactions through a funded relayer key",
        license(
            name = "MIT"
        )
    ),
    paths(
        forward_handler,
        status_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
    ),
    components(
        schemas(
            ForwardRequest,
            ForwardResponse,
            StatusResponse,
            HealthResponse,
            HealthStatus,
            QueueState,
            ErrorResponse,
            ErrorDetail,
            RateLimitResponse,
        )
    ),
    tags(
        (name = "relay", description = "Meta-transaction relay endpoints"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Relay a signed meta-transaction
///
/// Decodes the wrapped `transfer` call, checks it against chain state and
/// per-sender admission rules, then dispatches it from the relayer key.
///
/// **The response is returned once the transaction was accepted for broadcast,
/// not when it is mined.**
#[utoipa::path(
    post,
    path = "/transfer",
    tag = "relay",
    request_body = ForwardRequest,
    responses(
        (status = 200, description = "Transaction broadcast", body = ForwardResponse),
        (status = 400, description = "Invalid body, undecodable call or rejected transfer", body = ErrorResponse),
        (status = 429, description = "Concurrent request or grace period not elapsed", body = ErrorResponse),
        (status = 502, description = "Transaction rejected by the node", body = ErrorResponse),
        (status = 503, description = "Dispatch queue not running", body = ErrorResponse),
        (status = 504, description = "Broadcast retries exhausted", body = ErrorResponse)
    )
)]
pub async fn forward_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ForwardRequest>, JsonRejection>,
) -> Result<Json<ForwardResponse>, AppError> {
    let Json(payload) =
        payload.map_err(|e| ValidationError::InvalidBody(e.body_text()))?;
    let response = state.service.forward(&payload).await?;
    Ok(Json(response))
}

/// Relayer status
#[utoipa::path(
    get,
    path = "/status",
    tag = "relay",
    responses(
        (status = 200, description = "Relayer status", body = StatusResponse),
        (status = 503, description = "Ledger unavailable", body = ErrorResponse)
    )
)]
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, AppError> {
    let status = state.service.status().await?;
    Ok(Json(status))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Kubernetes liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let mut retry_after = None;

        let (status, error_type, message) = match &self {
            AppError::Validation(err) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                err.to_string(),
            ),
            AppError::Admission(err) => match err {
                AdmissionError::ConcurrentRequest => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "concurrent_request",
                    err.to_string(),
                ),
                AdmissionError::GracePeriod { retry_after: at } => {
                    retry_after = Some(at.format(HTTP_DATE_FORMAT).to_string());
                    (StatusCode::TOO_MANY_REQUESTS, "grace_period", err.to_string())
                }
            },
            AppError::Dispatch(err) => match err {
                DispatchError::QueueNotRunning | DispatchError::WorkerGone => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue_unavailable",
                    err.to_string(),
                ),
                DispatchError::RetriesExhausted { .. } => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "retries_exhausted",
                    err.to_string(),
                ),
                DispatchError::Rejected(_)
                | DispatchError::NonceConflict(_)
                | DispatchError::Signing(_) => {
                    (StatusCode::BAD_GATEWAY, "dispatch_failed", err.to_string())
                }
                DispatchError::Startup(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    err.to_string(),
                ),
            },
            AppError::Blockchain(bc_err) => match bc_err {
                BlockchainError::Network(_) | BlockchainError::RateLimited(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "blockchain_error",
                    self.to_string(),
                ),
                BlockchainError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                _ => (
                    StatusCode::BAD_GATEWAY,
                    "blockchain_error",
                    self.to_string(),
                ),
            },
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "database_error",
                    self.to_string(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    self.to_string(),
                ),
            },
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
        };

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        let mut response = (status, body).into_response();
        if let Some(value) = retry_after.and_then(|v| HeaderValue::from_str(&v).ok()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
