use crate::config::Config;
use crate::metrics;
use crate::store::ConsumerStore;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use forgeos_core::{validate_txid, ExecutionReceipt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
struct ConsumerState {
    store: Arc<ConsumerStore>,
    cfg: Config,
}

pub fn router(store: Arc<ConsumerStore>, cfg: Config) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v1/scheduler/cycle", post(cycle))
        .route("/v1/execution-receipts", post(post_receipt).get(get_receipt))
        .route("/v1/events", get(recent_events))
        .with_state(ConsumerState { store, cfg })
}

fn authorized(headers: &HeaderMap, cfg: &Config) -> bool {
    if cfg.auth_tokens.is_empty() {
        return true;
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| cfg.auth_tokens.iter().any(|x| x == t))
        .unwrap_or(false)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler() -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    encoder.encode(&families, &mut buf).unwrap();
    (StatusCode::OK, [("content-type", encoder.format_type())], buf)
}

#[derive(Debug, Deserialize)]
struct CycleEventBody {
    #[serde(default, rename = "callbackIdempotencyKey")]
    idempotency_key: Option<String>,
    #[serde(default, rename = "userId")]
    user_id: Option<String>,
    #[serde(default, rename = "agentId")]
    agent_id: Option<String>,
    #[serde(default, rename = "leaderFenceToken")]
    fence: Option<i64>,
    #[serde(default)]
    fence_token: Option<i64>,
}

async fn cycle(
    headers: HeaderMap,
    State(state): State<ConsumerState>,
    Json(body): Json<CycleEventBody>,
) -> axum::response::Response {
    if !authorized(&headers, &state.cfg) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error":{"message":"unauthorized"}}))).into_response();
    }

    let idem_key = headers
        .get("X-ForgeOS-Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or(body.idempotency_key.clone());
    let Some(idem_key) = idem_key else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error":{"message":"invalid_callback"}}))).into_response();
    };

    let agent_key = headers
        .get("X-ForgeOS-Agent-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| match (&body.user_id, &body.agent_id) {
            (Some(u), Some(a)) => Some(format!("{u}:{a}")),
            _ => None,
        });
    let Some(agent_key) = agent_key else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error":{"message":"invalid_callback"}}))).into_response();
    };

    let fence = body.fence.or(body.fence_token).unwrap_or(-1);
    if fence < 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({"error":{"message":"invalid_callback"}}))).into_response();
    }
    let fence = fence as u64;

    if !state.store.idempotency_claim(&idem_key) {
        metrics::CYCLE_EVENTS_TOTAL.with_label_values(&["duplicate"]).inc();
        return Json(json!({ "ok": true, "duplicate": true })).into_response();
    }

    if let Err(current) = state.store.check_and_advance_fence(&agent_key, fence) {
        metrics::CYCLE_EVENTS_TOTAL.with_label_values(&["stale_fence"]).inc();
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "error": {
                    "message": "stale_fence_token",
                    "currentFence": current,
                    "receivedFence": fence,
                },
            })),
        )
            .into_response();
    }

    state.store.push_event(json!({
        "agentKey": agent_key,
        "fence": fence,
        "idempotencyKey": idem_key,
        "ts": chrono::Utc::now(),
    }));
    metrics::CYCLE_EVENTS_TOTAL.with_label_values(&["accepted"]).inc();
    Json(json!({ "ok": true, "accepted": true, "duplicate": false })).into_response()
}

async fn post_receipt(
    headers: HeaderMap,
    State(state): State<ConsumerState>,
    Json(receipt): Json<ExecutionReceipt>,
) -> axum::response::Response {
    if !authorized(&headers, &state.cfg) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error":{"message":"unauthorized"}}))).into_response();
    }
    let txid = receipt.txid.to_lowercase();
    if !validate_txid(&txid) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error":{"message":"invalid_callback"}}))).into_response();
    }
    let idem_key = format!("receipt:{txid}");
    let is_new = state.store.idempotency_claim(&idem_key);
    let mut receipt = receipt;
    receipt.txid = txid;
    state.store.upsert_receipt(receipt.clone());
    metrics::RECEIPTS_TOTAL
        .with_label_values(&[if is_new { "accepted" } else { "updated" }])
        .inc();
    Json(json!({ "ok": true, "receipt": receipt })).into_response()
}

#[derive(Debug, Deserialize)]
struct ReceiptQuery {
    txid: String,
}

async fn get_receipt(
    State(state): State<ConsumerState>,
    Query(q): Query<ReceiptQuery>,
) -> axum::response::Response {
    let txid = q.txid.to_lowercase();
    match state.store.get_receipt(&txid) {
        Some(r) => Json(r).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error":{"message":"not_found"}}))).into_response(),
    }
}

async fn recent_events(State(state): State<ConsumerState>) -> axum::response::Response {
    let events: Vec<Value> = state.store.recent_events();
    Json(json!({ "events": events })).into_response()
}
