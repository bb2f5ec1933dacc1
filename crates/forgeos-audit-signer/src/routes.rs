use crate::log::AuditLog;
use crate::metrics;
use crate::signer::Signer;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct SignerState {
    pub signer: Arc<Signer>,
    pub log: Option<Arc<AuditLog>>,
}

pub fn router(state: SignerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v1/audit-sign", post(audit_sign))
        .route("/v1/public-key", get(public_key))
        .route("/v1/audit-log", get(audit_log))
        .with_state(state)
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
struct SignRequest {
    #[serde(rename = "signingPayload")]
    signing_payload: Value,
}

async fn audit_sign(
    State(state): State<SignerState>,
    Json(body): Json<SignRequest>,
) -> axum::response::Response {
    match state.signer.sign(&body.signing_payload).await {
        Ok(signature) => {
            metrics::SIGN_REQUESTS_TOTAL.with_label_values(&["ok"]).inc();
            if let Some(log) = &state.log {
                let record = json!({
                    "signingPayload": body.signing_payload,
                    "signature": signature,
                });
                if let Err(e) = log.append(record) {
                    tracing::warn!(error = %e, "audit log append failed");
                } else {
                    metrics::LOG_APPENDS_TOTAL.inc();
                }
            }
            Json(json!({ "ok": true, "signature": signature, "ts": chrono::Utc::now() })).into_response()
        }
        Err(e) => {
            metrics::SIGN_REQUESTS_TOTAL.with_label_values(&["error"]).inc();
            let kind = e.kind();
            let status = if kind == "audit_signer_not_configured" {
                StatusCode::SERVICE_UNAVAILABLE
            } else if kind.starts_with("audit_signer_command_timeout") {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!({ "error": { "message": kind } }))).into_response()
        }
    }
}

async fn public_key(State(state): State<SignerState>) -> axum::response::Response {
    match state.signer.public_key_pem() {
        Some(pem) => Json(json!({ "publicKeyPem": pem })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": "audit_signer_not_configured" } })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AuditLogQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    format: Option<String>,
}

fn default_limit() -> usize {
    100
}

async fn audit_log(
    State(state): State<SignerState>,
    Query(q): Query<AuditLogQuery>,
) -> axum::response::Response {
    let Some(log) = &state.log else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": "audit_signer_not_configured" } })),
        )
            .into_response();
    };
    match log.tail(q.limit) {
        Ok(records) => {
            if q.format.as_deref() == Some("jsonl") {
                let body = records
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                (StatusCode::OK, [("content-type", "application/x-ndjson")], body).into_response()
            } else {
                Json(json!({ "records": records })).into_response()
            }
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": { "message": e.kind() } })),
        )
            .into_response(),
    }
}
