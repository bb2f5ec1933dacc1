//! Explicit, constructed-once configuration. Every tunable is read from its
//! environment variable exactly once, here, and threaded through
//! `AppState` — nothing downstream re-reads `std::env`.

use std::collections::HashMap;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServiceToken {
    pub subject: String,
    pub scopes: Vec<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub instance_id: String,

    pub tick_ms: u64,
    pub cycle_concurrency: usize,
    pub max_queue_depth: usize,
    pub max_agents: usize,
    pub callback_timeout_ms: u64,

    pub leader_lock_ttl_ms: i64,
    pub leader_lock_renew_ms: u64,
    pub leader_backoff_base_ms: u64,
    pub leader_backoff_max_ms: u64,

    pub due_lease_ttl_ms: i64,
    pub exec_lease_ttl_ms: i64,
    pub callback_idempotency_lease_ttl_ms: i64,
    pub callback_idempotency_done_ttl_ms: i64,

    pub kas_api_base: Option<String>,
    pub kas_api_timeout_ms: u64,
    pub market_cache_ttl_ms: u64,
    pub balance_cache_ttl_ms: u64,

    pub jwt_hs256_secret: Option<String>,
    pub jwks_url: Option<String>,
    pub jwks_allowed_kids: Option<Vec<String>>,
    pub oidc_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub admin_tokens: Vec<String>,
    pub service_tokens: HashMap<String, ServiceToken>,

    pub quota_window_secs: i64,
    pub quota_read: u64,
    pub quota_write: u64,
    pub quota_tick: u64,

    pub data_dir: Option<std::path::PathBuf>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let service_tokens = std::env::var("SCHEDULER_SERVICE_TOKENS_JSON")
            .ok()
            .and_then(|s| serde_json::from_str::<HashMap<String, ServiceToken>>(&s).ok())
            .unwrap_or_default();
        let admin_tokens = std::env::var("SCHEDULER_AUTH_TOKENS")
            .ok()
            .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
            .unwrap_or_default();
        let jwks_allowed_kids = std::env::var("SCHEDULER_JWKS_ALLOWED_KIDS")
            .ok()
            .map(|s| s.split(',').map(|t| t.trim().to_string()).collect());

        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_u64("PORT", 8080) as u16,
            instance_id: env_string("INSTANCE_ID", &ulid::Ulid::new().to_string()),

            tick_ms: env_u64("SCHEDULER_TICK_MS", 1000),
            cycle_concurrency: env_usize("SCHEDULER_CYCLE_CONCURRENCY", 8),
            max_queue_depth: env_usize("SCHEDULER_MAX_QUEUE", 10_000),
            max_agents: env_usize("SCHEDULER_MAX_AGENTS", 5_000),
            callback_timeout_ms: env_u64("SCHEDULER_CALLBACK_TIMEOUT_MS", 8_000),

            leader_lock_ttl_ms: env_i64("SCHEDULER_LEADER_LOCK_TTL_MS", 15_000),
            leader_lock_renew_ms: env_u64("SCHEDULER_LEADER_LOCK_RENEW_MS", 7_000),
            leader_backoff_base_ms: env_u64("SCHEDULER_LEADER_BACKOFF_BASE_MS", 200),
            leader_backoff_max_ms: env_u64("SCHEDULER_LEADER_BACKOFF_MAX_MS", 10_000),

            due_lease_ttl_ms: env_i64("SCHEDULER_DUE_LEASE_TTL_MS", 30_000),
            exec_lease_ttl_ms: env_i64("SCHEDULER_REDIS_EXEC_LEASE_TTL_MS", 30_000),
            callback_idempotency_lease_ttl_ms: env_i64(
                "SCHEDULER_CALLBACK_IDEMPOTENCY_LEASE_TTL_MS",
                20_000,
            ),
            callback_idempotency_done_ttl_ms: env_i64(
                "SCHEDULER_CALLBACK_IDEMPOTENCY_TTL_MS",
                24 * 60 * 60 * 1000,
            ),

            kas_api_base: std::env::var("KAS_API_BASE").ok(),
            kas_api_timeout_ms: env_u64("KAS_API_TIMEOUT_MS", 4_000),
            market_cache_ttl_ms: env_u64("SCHEDULER_MARKET_CACHE_TTL_MS", 5_000),
            balance_cache_ttl_ms: env_u64("SCHEDULER_BALANCE_CACHE_TTL_MS", 10_000),

            jwt_hs256_secret: std::env::var("SCHEDULER_JWT_HS256_SECRET").ok(),
            jwks_url: std::env::var("SCHEDULER_JWKS_URL").ok(),
            jwks_allowed_kids,
            oidc_issuer: std::env::var("SCHEDULER_OIDC_ISSUER").ok(),
            jwt_audience: std::env::var("SCHEDULER_JWT_AUDIENCE").ok(),
            admin_tokens,
            service_tokens,

            quota_window_secs: env_i64("SCHEDULER_QUOTA_WINDOW_SECS", 60),
            quota_read: env_u64("SCHEDULER_QUOTA_READ", 600),
            quota_write: env_u64("SCHEDULER_QUOTA_WRITE", 120),
            quota_tick: env_u64("SCHEDULER_QUOTA_TICK", 60),

            data_dir: std::env::var("DATA_DIR").ok().map(std::path::PathBuf::from),
            tls_cert_path: std::env::var("TLS_CERT_PATH").ok(),
            tls_key_path: std::env::var("TLS_KEY_PATH").ok(),
        }
    }

    pub fn leader_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.leader_lock_ttl_ms.max(0) as u64)
    }
}
