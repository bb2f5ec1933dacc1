#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub private_key_pem: Option<String>,
    pub external_command: Option<String>,
    pub command_timeout_ms: u64,
    pub append_log_path: Option<std::path::PathBuf>,
    pub key_id: String,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let private_key_pem = std::env::var("AUDIT_SIGNER_PRIVATE_KEY_PEM").ok().or_else(|| {
            std::env::var("AUDIT_SIGNER_PRIVATE_KEY_PATH")
                .ok()
                .and_then(|p| std::fs::read_to_string(p).ok())
        });
        Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_u64("PORT", 8082) as u16,
            private_key_pem,
            external_command: std::env::var("AUDIT_SIGNER_COMMAND").ok(),
            command_timeout_ms: env_u64("AUDIT_SIGNER_COMMAND_TIMEOUT_MS", 5_000),
            append_log_path: std::env::var("AUDIT_SIGNER_APPEND_LOG_PATH")
                .ok()
                .map(std::path::PathBuf::from),
            key_id: env_string("AUDIT_SIGNER_KEY_ID", "forgeos-audit-signer-default"),
        }
    }
}
