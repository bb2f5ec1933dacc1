use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// `userId:agentId`, the primary sharding key for per-agent state.
pub type QueueKey = String;
pub type TaskId = String;

pub fn queue_key(user_id: &str, agent_id: &str) -> QueueKey {
    format!("{}:{}", user_id, agent_id)
}

pub fn split_queue_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Running,
    Paused,
}

/// Summary of the most recent dispatch attempt, surfaced on `GET /v1/agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastDispatch {
    pub ts: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Authoritative agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub user_id: String,
    pub agent_id: String,
    pub queue_key: QueueKey,
    pub display_name: String,
    pub wallet_address: String,
    pub status: AgentStatus,
    pub cycle_interval_ms: u64,
    pub callback_url: Option<String>,
    pub strategy_label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub failure_count: u64,
    pub queue_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatch: Option<LastDispatch>,
}

impl Agent {
    pub fn is_running(&self) -> bool {
        matches!(self.status, AgentStatus::Running)
    }
}

/// Body of `POST /v1/agents/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAgentRequest {
    pub user_id: String,
    pub agent_id: String,
    pub display_name: String,
    pub wallet_address: String,
    #[serde(default)]
    pub cycle_interval_ms: Option<u64>,
    pub callback_url: Option<String>,
    #[serde(default)]
    pub strategy_label: Option<String>,
}

/// Body of `POST /v1/agents/{id}/control`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlAction {
    Pause,
    Resume,
    Remove,
    UpdateCycleIntervalMs { cycle_interval_ms: u64 },
}

/// Execution task materialized into the execution queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub id: TaskId,
    pub kind: String,
    pub queue_key: QueueKey,
    pub enqueued_at: DateTime<Utc>,
    pub leader_fence_token: u64,
    pub instance_id: String,
}

impl ExecutionTask {
    pub fn new_cycle(queue_key: QueueKey, leader_fence_token: u64, instance_id: String) -> Self {
        Self {
            id: Ulid::new().to_string(),
            kind: "agent_cycle".to_string(),
            queue_key,
            enqueued_at: Utc::now(),
            leader_fence_token,
            instance_id,
        }
    }
}

/// Terminal record for a broadcast transaction, owned by the callback
/// consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub txid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_key: Option<String>,
    pub status: String,
    pub confirmations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_kas: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_sompi: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_ts_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage_kas: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_at_broadcast_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_at_confirm_usd: Option<f64>,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

/// Mainnet/testnet address prefixes accepted for `wallet_address`.
pub const KASPA_MAINNET_PREFIX: &str = "kaspa:";
pub const KASPA_TESTNET_PREFIX: &str = "kaspatest:";

pub const MAX_IDENTITY_LEN: usize = 120;
pub const MIN_CYCLE_INTERVAL_MS: u64 = 1000;
