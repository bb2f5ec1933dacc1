//! Control plane HTTP surface. Every non-public route goes through
//! `enforce` for auth + quota before the handler runs.

use crate::auth::{self, AuthContext};
use crate::quota;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use forgeos_core::{
    validate_callback_url, validate_cycle_interval_ms, validate_identity, validate_wallet_address,
    Agent, AgentStatus, ControlAction, RegisterAgentRequest, SchedulerError,
};
use serde_json::json;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v1/agents/register", post(register_agent))
        .route("/v1/agents", get(list_agents))
        .route("/v1/agents/:id/control", post(control_agent))
        .route("/v1/scheduler/tick", post(force_tick))
        .with_state(state)
}

async fn enforce(
    headers: &HeaderMap,
    method: &Method,
    path: &str,
    state: &AppState,
) -> Result<AuthContext, SchedulerError> {
    let scope = auth::route_scope(method, path);
    if scope == "public" {
        return Ok(AuthContext::admin());
    }
    let ctx = auth::authenticate(headers, &state.cfg, state.jwks.as_ref()).await?;
    auth::require(&ctx, scope)?;
    quota::enforce(&state.store, &state.cfg, &ctx.subject, quota::bucket_for_scope(scope)).await?;
    Ok(ctx)
}

fn err_response(e: SchedulerError) -> axum::response::Response {
    let status = match &e {
        SchedulerError::NotFound => StatusCode::NOT_FOUND,
        SchedulerError::Unauthorized => StatusCode::UNAUTHORIZED,
        SchedulerError::Forbidden => StatusCode::FORBIDDEN,
        SchedulerError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        SchedulerError::Conflict(_) | SchedulerError::StaleFenceToken { .. } => StatusCode::CONFLICT,
        SchedulerError::SchedulerFull | SchedulerError::SchedulerQueueFull => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SchedulerError::AgentIdRequired
        | SchedulerError::WalletAddressRequired
        | SchedulerError::InvalidCallback
        | SchedulerError::Invalid(_) => StatusCode::BAD_REQUEST,
        SchedulerError::Internal(_)
        | SchedulerError::AuditSignerNotConfigured
        | SchedulerError::AuditSignerCommandTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": { "message": e.kind() } }))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(headers: HeaderMap, State(state): State<AppState>) -> axum::response::Response {
    if let Err(e) = enforce(&headers, &Method::GET, "/metrics", &state).await {
        return err_response(e);
    }
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    encoder.encode(&families, &mut buf).unwrap();
    (
        StatusCode::OK,
        [("content-type", encoder.format_type())],
        buf,
    )
        .into_response()
}

async fn register_agent(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(body): Json<RegisterAgentRequest>,
) -> axum::response::Response {
    if let Err(e) = enforce(&headers, &Method::POST, "/v1/agents/register", &state).await {
        return err_response(e);
    }
    if let Err(e) = validate_identity(&body.user_id).and_then(|_| validate_identity(&body.agent_id))
    {
        return err_response(e);
    }
    if let Err(e) = validate_wallet_address(&body.wallet_address) {
        return err_response(e);
    }
    if let Err(e) = validate_callback_url(&body.callback_url) {
        return err_response(e);
    }
    let cycle_interval_ms = body.cycle_interval_ms.unwrap_or(60_000);
    if let Err(e) = validate_cycle_interval_ms(cycle_interval_ms) {
        return err_response(e);
    }

    let queue_key = forgeos_core::queue_key(&body.user_id, &body.agent_id);
    let now = chrono::Utc::now();
    let next_run_at = now + chrono::Duration::milliseconds(cycle_interval_ms.min(1000) as i64);
    let agent = Agent {
        user_id: body.user_id,
        agent_id: body.agent_id,
        queue_key: queue_key.clone(),
        display_name: body.display_name,
        wallet_address: body.wallet_address,
        status: AgentStatus::Running,
        cycle_interval_ms,
        callback_url: body.callback_url,
        strategy_label: body.strategy_label.unwrap_or_else(|| "default".to_string()),
        created_at: now,
        updated_at: now,
        last_cycle_at: None,
        next_run_at,
        failure_count: 0,
        queue_pending: false,
        last_dispatch: None,
    };

    match state.store.agent_count().await {
        Ok(n) if n >= state.cfg.max_agents as u64 => {
            return err_response(SchedulerError::SchedulerFull)
        }
        Err(e) => return err_response(e),
        _ => {}
    }

    match state.store.put_agent(agent).await {
        Ok(a) => {
            if let Err(e) = state.store.schedule(&queue_key, a.next_run_at).await {
                return err_response(e);
            }
            (StatusCode::CREATED, Json(a)).into_response()
        }
        Err(e) => err_response(e),
    }
}

async fn list_agents(headers: HeaderMap, State(state): State<AppState>) -> axum::response::Response {
    if let Err(e) = enforce(&headers, &Method::GET, "/v1/agents", &state).await {
        return err_response(e);
    }
    match state.store.list_agents().await {
        Ok(agents) => Json(json!({ "agents": agents })).into_response(),
        Err(e) => err_response(e),
    }
}

async fn control_agent(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(queue_key): Path<String>,
    Json(action): Json<ControlAction>,
) -> axum::response::Response {
    let path = format!("/v1/agents/{queue_key}/control");
    if let Err(e) = enforce(&headers, &Method::POST, &path, &state).await {
        return err_response(e);
    }
    match action {
        ControlAction::Remove => match state.store.remove_agent(&queue_key).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => err_response(e),
        },
        ControlAction::Pause => {
            update_status(&state, &queue_key, AgentStatus::Paused, None).await
        }
        ControlAction::Resume => {
            update_status(&state, &queue_key, AgentStatus::Running, None).await
        }
        ControlAction::UpdateCycleIntervalMs { cycle_interval_ms } => {
            if let Err(e) = validate_cycle_interval_ms(cycle_interval_ms) {
                return err_response(e);
            }
            update_status(&state, &queue_key, AgentStatus::Running, Some(cycle_interval_ms)).await
        }
    }
}

async fn update_status(
    state: &AppState,
    queue_key: &str,
    status: AgentStatus,
    cycle_interval_ms: Option<u64>,
) -> axum::response::Response {
    let result = state
        .store
        .update_agent(
            queue_key,
            Box::new(move |a: &mut Agent| {
                a.status = status;
                if let Some(ms) = cycle_interval_ms {
                    a.cycle_interval_ms = ms;
                }
                a.updated_at = chrono::Utc::now();
            }),
        )
        .await;
    match result {
        Ok(agent) => {
            if matches!(agent.status, AgentStatus::Running) {
                let _ = state.store.schedule(queue_key, agent.next_run_at).await;
            } else {
                let _ = state.store.unschedule(queue_key).await;
            }
            Json(agent).into_response()
        }
        Err(e) => err_response(e),
    }
}

async fn force_tick(headers: HeaderMap, State(state): State<AppState>) -> axum::response::Response {
    if let Err(e) = enforce(&headers, &Method::POST, "/v1/scheduler/tick", &state).await {
        return err_response(e);
    }
    if !state.leader.is_leader() {
        return err_response(SchedulerError::Forbidden);
    }
    crate::tick::force_once(&state.store, &state.leader, &state.cfg)
        .await
        .map(|_| StatusCode::ACCEPTED.into_response())
        .unwrap_or_else(err_response)
}
