//! Wraps `SchedulerStore::quota_check` with the bucket limits from `Config`
//! across the three request buckets: read, write, and tick.

use crate::config::Config;
use crate::metrics;
use chrono::Utc;
use forgeos_core::{Result, SchedulerError};
use forgeos_store::SchedulerStore;
use std::sync::Arc;

pub async fn enforce(
    store: &Arc<dyn SchedulerStore>,
    cfg: &Config,
    subject: &str,
    bucket: &str,
) -> Result<()> {
    let (limit, window) = match bucket {
        "read" => (cfg.quota_read, cfg.quota_window_secs),
        "write" => (cfg.quota_write, cfg.quota_window_secs),
        "tick" => (cfg.quota_tick, cfg.quota_window_secs),
        _ => return Ok(()),
    };
    let within = store
        .quota_check(subject, bucket, window, limit, Utc::now())
        .await?;
    if within {
        Ok(())
    } else {
        metrics::QUOTA_REJECTED_TOTAL.with_label_values(&[bucket]).inc();
        Err(SchedulerError::QuotaExceeded)
    }
}

pub fn bucket_for_scope(scope: &str) -> &'static str {
    match scope {
        "scheduler:tick" => "tick",
        "agent:write" => "write",
        "agent:read" | "metrics:read" => "read",
        _ => "read",
    }
}
