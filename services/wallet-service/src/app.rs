use std::sync::Arc;

use axum::http::{header::{ACCEPT, CONTENT_TYPE}, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{middleware, routing::{get, post}, Json, Router};
use common_http_errors::ApiError;
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use crate::capture::SpendPolicy;
use crate::events::EventQueue;
use crate::gateway::{BankGateway, PinVerifier};
use crate::intent_handlers::{approve_intent, get_intent_detail, initiate_intent};
use crate::refund_handlers::refund_transaction;
use crate::wallet_handlers::{charge_wallet, get_store_balance, transfer_points};

// --- Error metrics (mirrors the sibling services) ---
pub static WALLET_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("http_errors_total", "Count of HTTP error responses emitted (status >= 400)"),
        &["service", "code", "status"],
    ).unwrap();
    WALLET_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static CAPTURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("wallet_captures_total", "Fund captures by outcome"),
        &["outcome"],
    ).unwrap();
    WALLET_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static REFUNDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("wallet_refunds_total", "Full cancellations by outcome"),
        &["outcome"],
    ).unwrap();
    WALLET_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static SETTLEMENT_RUN_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let v = HistogramVec::new(
        HistogramOpts::new("settlement_run_seconds", "Settlement batch phase durations"),
        &["phase"],
    ).unwrap();
    WALLET_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub async fn http_error_metrics(req: axum::http::Request<axum::body::Body>, next: axum::middleware::Next) -> axum::response::Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.as_u16() >= 400 {
        let code = resp.headers().get("X-Error-Code").and_then(|v| v.to_str().ok()).unwrap_or("unknown");
        HTTP_ERRORS_TOTAL.with_label_values(&["wallet-service", code, status.as_str()]).inc();
    }
    resp
}

pub async fn health() -> &'static str { "ok" }

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub bank: Arc<dyn BankGateway>,
    pub pin: Arc<dyn PinVerifier>,
    pub events: EventQueue,
    pub spend_policy: SpendPolicy,
    pub charge_lot_validity_days: i64,
}

/// `Idempotency-Key` header, mandatory on every mutating endpoint.
pub(crate) fn idempotency_key_from_headers(
    headers: &axum::http::HeaderMap,
) -> Result<Uuid, ApiError> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or(ApiError::BadRequest {
            code: "missing_idempotency_key",
            trace_id: None,
            message: Some("Idempotency-Key header must be a UUID".into()),
        })
}

/// Rebuild a response from a stored (status, body) pair. Used both for the
/// original send and for replays so the two are byte-identical.
pub(crate) fn snapshot_response(status: i32, body: serde_json::Value) -> Response {
    let status = StatusCode::from_u16(status as u16).unwrap_or(StatusCode::OK);
    let code = body
        .get("code")
        .and_then(|c| c.as_str())
        .map(|c| c.to_owned());
    let mut resp = (status, Json(body)).into_response();
    if status.as_u16() >= 400 {
        if let Some(code) = code {
            if let Ok(val) = HeaderValue::from_str(&code) {
                resp.headers_mut().insert("X-Error-Code", val);
            }
        }
    }
    resp
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:3001",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins.iter().filter_map(|o| o.parse::<HeaderValue>().ok()).collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-actor-type"),
            HeaderName::from_static("x-actor-id"),
            HeaderName::from_static("x-trace-id"),
        ]);

    async fn metrics() -> (StatusCode, String) {
        let encoder = TextEncoder::new();
        let families = WALLET_REGISTRY.gather();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buf) {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}"));
        }
        (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
    }

    Router::new()
        .route("/healthz", get(health))
        .route("/cpqr/:qr_token_id/initiate", post(initiate_intent))
        .route("/payments/:public_id/approve", post(approve_intent))
        .route("/api/payments/intent/:public_id", get(get_intent_detail))
        .route("/api/stores/:store_id/transactions/:tx_id/refund", post(refund_transaction))
        .route("/api/wallets/:wallet_id/stores/:store_id/charge", post(charge_wallet))
        .route("/api/wallets/:wallet_id/transfer", post(transfer_points))
        .route("/api/wallets/:wallet_id/stores/:store_id/balance", get(get_store_balance))
        .route("/internal/metrics", get(metrics))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(http_error_metrics))
}
