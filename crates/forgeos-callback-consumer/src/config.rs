#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub idempotency_ttl_secs: i64,
    pub ring_buffer_cap: usize,
    pub receipt_lru_cap: usize,
    pub auth_tokens: Vec<String>,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let auth_tokens = std::env::var("CONSUMER_AUTH_TOKENS")
            .ok()
            .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
            .unwrap_or_default();
        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_usize("PORT", 8081) as u16,
            idempotency_ttl_secs: env_i64("CONSUMER_IDEMPOTENCY_TTL_SECS", 24 * 60 * 60),
            ring_buffer_cap: env_usize("CONSUMER_EVENTS_RING_CAP", 500),
            receipt_lru_cap: env_usize("CONSUMER_RECEIPT_LRU_CAP", 2048),
            auth_tokens,
        }
    }
}
