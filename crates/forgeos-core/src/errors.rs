use thiserror::Error;

/// Error kinds surfaced over HTTP as `{error:{message: <kind>}}`. The
/// `Display` impl for each variant is the literal `kind` string.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("not_found")]
    NotFound,
    #[error("agent_id_required")]
    AgentIdRequired,
    #[error("wallet_address_required")]
    WalletAddressRequired,
    #[error("invalid_callback")]
    InvalidCallback,
    #[error("scheduler_full")]
    SchedulerFull,
    #[error("scheduler_queue_full")]
    SchedulerQueueFull,
    #[error("stale_fence_token")]
    StaleFenceToken { current: u64, received: u64 },
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("quota_exceeded")]
    QuotaExceeded,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("audit_signer_not_configured")]
    AuditSignerNotConfigured,
    #[error("audit_signer_command_timeout_{0}")]
    AuditSignerCommandTimeout(u64),
}

impl SchedulerError {
    /// The stable `kind` string used in error envelopes and metrics labels.
    /// Most variants are static; `AuditSignerCommandTimeout` carries the
    /// timeout value in the kind itself.
    pub fn kind(&self) -> String {
        match self {
            SchedulerError::NotFound => "not_found".to_string(),
            SchedulerError::AgentIdRequired => "agent_id_required".to_string(),
            SchedulerError::WalletAddressRequired => "wallet_address_required".to_string(),
            SchedulerError::InvalidCallback => "invalid_callback".to_string(),
            SchedulerError::SchedulerFull => "scheduler_full".to_string(),
            SchedulerError::SchedulerQueueFull => "scheduler_queue_full".to_string(),
            SchedulerError::StaleFenceToken { .. } => "stale_fence_token".to_string(),
            SchedulerError::Unauthorized => "unauthorized".to_string(),
            SchedulerError::Forbidden => "forbidden".to_string(),
            SchedulerError::QuotaExceeded => "quota_exceeded".to_string(),
            SchedulerError::Conflict(_) => "conflict".to_string(),
            SchedulerError::Invalid(_) => "invalid".to_string(),
            SchedulerError::Internal(_) => "internal".to_string(),
            SchedulerError::AuditSignerNotConfigured => "audit_signer_not_configured".to_string(),
            SchedulerError::AuditSignerCommandTimeout(ms) => {
                format!("audit_signer_command_timeout_{ms}")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
