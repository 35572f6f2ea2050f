//! HTTP-level tests for the relay endpoints.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use alloy::primitives::{Address, U256, address};
use chrono::Utc;
use http_body_util::BodyExt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use meta_tx_relayer::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use meta_tx_relayer::app::{AppState, DispatchConfig, DispatchQueue, RelayConfig};
use meta_tx_relayer::domain::{
    BlockSummary, ErrorResponse, ForwardRequest, ForwardResponse, GracePeriodStore,
    HealthResponse, HealthStatus, LedgerClient, QueueState, StatusResponse, TransactionSigner,
};
use meta_tx_relayer::infra::LocalSigner;
use meta_tx_relayer::infra::blockchain::encode_transfer;
use meta_tx_relayer::test_utils::{MockGraceStore, MockLedgerClient};

const SENDER: Address = address!("FeaED3f817169C012D040F05C6c52bCE5740Fc37");
const RECIPIENT: Address = address!("4DCeBf483fA7f31FfCee6e4EAffC1D78308Ec2cD");
const TOKEN: Address = address!("0B220b82F3eA3B7F6d9A1D8ab58930C064A2b5Bf");
const BALANCE: u64 = 1_000_000;

struct TestApp {
    ledger: Arc<MockLedgerClient>,
    grace_store: Arc<MockGraceStore>,
    queue: Arc<DispatchQueue>,
    state: Arc<AppState>,
}

async fn create_test_app(grace_period: Option<Duration>) -> TestApp {
    let ledger = Arc::new(MockLedgerClient::with_nonce(17));
    ledger.set_latest_block(BlockSummary {
        number: 500,
        timestamp: Utc::now().timestamp() as u64,
        pending: false,
    });
    ledger.set_token_balance(SENDER, U256::from(BALANCE));

    let signer: Arc<dyn TransactionSigner> = Arc::new(LocalSigner::random());
    let queue = Arc::new(DispatchQueue::new(
        Arc::clone(&ledger) as Arc<dyn LedgerClient>,
        signer,
        DispatchConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..DispatchConfig::default()
        },
    ));
    queue.start().await.unwrap();

    let grace_store = Arc::new(MockGraceStore::new());
    let state = Arc::new(AppState::new(
        Arc::clone(&ledger) as Arc<dyn LedgerClient>,
        Arc::clone(&grace_store) as Arc<dyn GracePeriodStore>,
        Arc::clone(&queue),
        RelayConfig::new(TOKEN).with_grace_period(grace_period),
    ));

    TestApp {
        ledger,
        grace_store,
        queue,
        state,
    }
}

fn forward_request(amount: u64) -> ForwardRequest {
    ForwardRequest {
        r: format!("0x{}", "ab".repeat(32)),
        s: format!("0x{}", "cd".repeat(32)),
        v: "0x1c".to_string(),
        sender: SENDER.to_checksum(None),
        abi_function_call: alloy::hex::encode_prefixed(encode_transfer(
            RECIPIENT,
            U256::from(amount),
        )),
        signed_request: None,
        block_number: None,
    }
}

fn post_json(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send_forward(router: &Router, request: &ForwardRequest) -> axum::response::Response {
    router
        .clone()
        .oneshot(post_json(
            "/transfer",
            serde_json::to_string(request).unwrap(),
        ))
        .await
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// POST /transfer
// ============================================================================

#[tokio::test]
async fn test_forward_full_withdrawal_returns_tx_id() {
    let app = create_test_app(None).await;
    let router = create_router(Arc::clone(&app.state));

    let response = send_forward(&router, &forward_request(BALANCE)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: ForwardResponse = body_json(response).await;
    let accepted = app.ledger.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].0, 17);
    assert_eq!(body.tx_id, accepted[0].1.to_string());

    let attempts = app.ledger.broadcast_attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].nonce, 17);
}

#[tokio::test]
async fn test_forward_response_uses_camel_case() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let response = send_forward(&router, &forward_request(BALANCE)).await;
    let body: serde_json::Value = body_json(response).await;
    assert!(body.get("txId").and_then(|v| v.as_str()).is_some_and(|id| id.starts_with("0x")));
}

#[tokio::test]
async fn test_partial_withdrawal_never_reaches_queue() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let response = send_forward(&router, &forward_request(BALANCE - 1)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: ErrorResponse = body_json(response).await;
    assert_eq!(body.error.message, "Only full withdrawals are supported");
    assert!(app.ledger.broadcast_attempts().is_empty());
}

#[tokio::test]
async fn test_zero_amount_is_rejected() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let response = send_forward(&router, &forward_request(0)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = body_json(response).await;
    assert_eq!(body.error.message, "Cannot transfer 0 tokens");
}

#[tokio::test]
async fn test_malformed_json_is_invalid_body() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let response = router
        .oneshot(post_json("/transfer", "{\"r\": 1".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = body_json(response).await;
    assert!(body.error.message.starts_with("invalid request body"));
}

#[tokio::test]
async fn test_missing_fields_are_invalid_body() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let response = router
        .oneshot(post_json(
            "/transfer",
            serde_json::json!({ "sender": SENDER.to_checksum(None) }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_hex_field_is_invalid_body() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let mut request = forward_request(BALANCE);
    request.r = "0xzz".to_string();
    let response = send_forward(&router, &request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = body_json(response).await;
    assert!(body.error.message.starts_with("invalid request body"));
}

#[tokio::test]
async fn test_non_transfer_call_is_undecodable() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let mut request = forward_request(BALANCE);
    request.abi_function_call = "0x095ea7b3".to_string();
    let response = send_forward(&router, &request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = body_json(response).await;
    assert_eq!(body.error.message, "unable to decode transaction");
}

#[tokio::test]
async fn test_unknown_block_number() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let mut request = forward_request(BALANCE);
    request.block_number = Some("0x2a".to_string());
    let response = send_forward(&router, &request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = body_json(response).await;
    assert_eq!(body.error.message, "Block 42 not found");
}

#[tokio::test]
async fn test_explicit_block_number_is_used_for_balance_check() {
    let app = create_test_app(None).await;
    app.ledger.add_block(BlockSummary {
        number: 499,
        timestamp: Utc::now().timestamp() as u64,
        pending: false,
    });
    let router = create_router(app.state);

    let mut request = forward_request(BALANCE);
    request.block_number = Some("499".to_string());
    let response = send_forward(&router, &request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_grace_period_returns_429_with_retry_after() {
    let app = create_test_app(Some(Duration::from_secs(3600))).await;
    let router = create_router(app.state);

    let first = send_forward(&router, &forward_request(BALANCE)).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = send_forward(&router, &forward_request(BALANCE)).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after = second
        .headers()
        .get(header::RETRY_AFTER)
        .expect("Retry-After header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(retry_after.ends_with(" GMT"));

    let body: ErrorResponse = body_json(second).await;
    assert_eq!(body.error.message, "Grace period did not pass for this address");
    assert_eq!(app.ledger.accepted().len(), 1);
}

#[tokio::test]
async fn test_disconnected_client_keeps_sender_locked_until_broadcast() {
    let app = create_test_app(Some(Duration::from_secs(3600))).await;
    app.ledger.set_broadcast_delay(Duration::from_millis(200));
    let router = create_router(Arc::clone(&app.state));

    let request = forward_request(BALANCE);
    let dropped =
        tokio::time::timeout(Duration::from_millis(50), send_forward(&router, &request)).await;
    assert!(dropped.is_err());

    let concurrent = send_forward(&router, &request).await;
    assert_eq!(concurrent.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: ErrorResponse = body_json(concurrent).await;
    assert_eq!(body.error.r#type, "concurrent_request");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(app.ledger.accepted().len(), 1);
    assert!(app.grace_store.last_accepted(SENDER).await.unwrap().is_some());

    let after = send_forward(&router, &request).await;
    assert_eq!(after.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(after.headers().contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn test_failed_grace_store_lookup_is_server_error() {
    let ledger = Arc::new(MockLedgerClient::new());
    ledger.set_latest_block(BlockSummary {
        number: 1,
        timestamp: Utc::now().timestamp() as u64,
        pending: false,
    });
    ledger.set_token_balance(SENDER, U256::from(BALANCE));
    let queue = Arc::new(DispatchQueue::new(
        Arc::clone(&ledger) as Arc<dyn LedgerClient>,
        Arc::new(LocalSigner::random()),
        DispatchConfig::default(),
    ));
    queue.start().await.unwrap();
    let state = Arc::new(AppState::new(
        Arc::clone(&ledger) as Arc<dyn LedgerClient>,
        Arc::new(MockGraceStore::failing("connection reset")),
        queue,
        RelayConfig::new(TOKEN).with_grace_period(Some(Duration::from_secs(60))),
    ));
    let router = create_router(state);

    let response = send_forward(&router, &forward_request(BALANCE)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(ledger.broadcast_attempts().is_empty());
}

#[tokio::test]
async fn test_stopped_queue_returns_503() {
    let app = create_test_app(None).await;
    app.queue.stop().await;
    let router = create_router(app.state);

    let response = send_forward(&router, &forward_request(BALANCE)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_rejected_broadcast_returns_502() {
    let app = create_test_app(None).await;
    app.ledger
        .script_broadcasts([Err(meta_tx_relayer::domain::BlockchainError::Rejected {
            reason: "insufficient funds for gas * price + value".to_string(),
            accepted: false,
        })]);
    let router = create_router(app.state);

    let response = send_forward(&router, &forward_request(BALANCE)).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_exhausted_retries_return_504() {
    let app = create_test_app(None).await;
    app.ledger.script_broadcasts(
        (0..5).map(|_| Err(meta_tx_relayer::domain::BlockchainError::Network("reset".into()))),
    );
    let router = create_router(app.state);

    let response = send_forward(&router, &forward_request(BALANCE)).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

// ============================================================================
// GET /status and health
// ============================================================================

#[tokio::test]
async fn test_status_endpoint() {
    let app = create_test_app(Some(Duration::from_millis(2500))).await;
    app.ledger
        .set_native_balance(U256::from(2_000_000_000_000_000_000u128));
    let relayer = app.queue.address();
    let router = create_router(app.state);

    let response = router.oneshot(get("/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let raw: serde_json::Value = body_json(response).await;
    for key in ["networkId", "address", "gas", "queueSize", "contractAddress", "gracePeriodMs"] {
        assert!(raw.get(key).is_some(), "missing {}", key);
    }

    let status: StatusResponse = serde_json::from_value(raw).unwrap();
    assert_eq!(status.network_id, 137);
    assert_eq!(status.address, relayer.to_checksum(None));
    assert!(status.gas.starts_with("2."));
    assert_eq!(status.grace_period_ms, Some(2500));
}

#[tokio::test]
async fn test_health_reports_components() {
    let app = create_test_app(None).await;
    let router = create_router(Arc::clone(&app.state));

    let response = router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse = body_json(response).await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.queue, QueueState::Running);

    app.grace_store.set_healthy(false);
    let health: HealthResponse = body_json(router.clone().oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.grace_store, HealthStatus::Unhealthy);

    let ready = router.clone().oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    app.queue.stop().await;
    let ready = router.oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_unhealthy_ledger_fails_readiness() {
    let app = create_test_app(None).await;
    app.ledger.set_healthy(false);
    let router = create_router(app.state);

    let ready = router.clone().oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    let live = router.oneshot(get("/health/live")).await.unwrap();
    assert_eq!(live.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_global_rate_limit() {
    let app = create_test_app(None).await;
    let one = NonZeroU32::new(1).unwrap();
    let router = create_router_with_rate_limit(
        app.state,
        RateLimitConfig {
            requests_per_second: one,
            burst_size: one,
        },
    );

    let first = router.clone().oneshot(get("/health/live")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = router.oneshot(get("/health/live")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = create_test_app(None).await;
    let router = create_router(app.state);

    let response = router.oneshot(get("/api-docs/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc: serde_json::Value = body_json(response).await;
    assert!(doc["paths"].get("/transfer").is_some());
}
