//! Router construction and global rate limiting.

use std::env;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tower_http::{
    cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;
use crate::domain::{ErrorDetail, RateLimitResponse};

use super::handlers::{
    ApiDoc, forward_handler, health_check_handler, liveness_handler, readiness_handler,
    status_handler,
};

/// Request body limit; relay payloads are a few hundred bytes
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Applies to every route except `/transfer`, which waits for its job to
/// become terminal and is bounded by the dispatch retry policy instead
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Global rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub burst_size: NonZeroU32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            burst_size: NonZeroU32::new(20).unwrap_or(NonZeroU32::MIN),
        }
    }
}

impl RateLimitConfig {
    /// Load from `RATE_LIMIT_RPS` / `RATE_LIMIT_BURST`, falling back to defaults
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse = |name: &str| {
            env::var(name)
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .and_then(NonZeroU32::new)
        };
        Self {
            requests_per_second: parse("RATE_LIMIT_RPS").unwrap_or(defaults.requests_per_second),
            burst_size: parse("RATE_LIMIT_BURST").unwrap_or(defaults.burst_size),
        }
    }
}

fn routes(app_state: Arc<AppState>) -> Router {
    let bounded = Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .route("/transfer", post(forward_handler))
        .merge(bounded)
        .with_state(app_state)
}

fn with_common_layers(router: Router) -> Router {
    router
        .merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create the application router without rate limiting
pub fn create_router(app_state: Arc<AppState>) -> Router {
    with_common_layers(routes(app_state))
}

/// Create the application router with a global rate limit
pub fn create_router_with_rate_limit(app_state: Arc<AppState>, config: RateLimitConfig) -> Router {
    let quota = Quota::per_second(config.requests_per_second).allow_burst(config.burst_size);
    let limiter: Arc<DefaultDirectRateLimiter> = Arc::new(RateLimiter::direct(quota));
    let retry_after = u64::from(config.burst_size.get() / config.requests_per_second.get()).max(1);

    let router = routes(app_state).layer(middleware::from_fn_with_state(
        (limiter, retry_after),
        rate_limit_middleware,
    ));
    with_common_layers(router)
}

async fn rate_limit_middleware(
    State((limiter, retry_after)): State<(Arc<DefaultDirectRateLimiter>, u64)>,
    request: Request,
    next: Next,
) -> Response {
    if limiter.check().is_err() {
        warn!(path = %request.uri().path(), "Global rate limit exceeded");
        let body = RateLimitResponse {
            error: ErrorDetail {
                r#type: "rate_limited".to_string(),
                message: "Rate limit exceeded".to_string(),
            },
            retry_after,
        };
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }
    next.run(request).await
}
