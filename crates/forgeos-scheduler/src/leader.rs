//! Leader election loop. One replica holds the lock at a time; it renews at
//! roughly half the TTL and backs off exponentially after a failed renewal
//! before retrying acquisition.

use crate::config::Config;
use crate::metrics;
use forgeos_store::SchedulerStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared view of current leadership, read by the tick loop and dispatch
/// workers to stamp `leaderFenceToken` on claims without blocking on the
/// leader task itself.
#[derive(Default)]
pub struct LeaderState {
    is_leader: AtomicBool,
    fence_token: AtomicU64,
}

impl LeaderState {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn fence_token(&self) -> u64 {
        self.fence_token.load(Ordering::Acquire)
    }

    fn set(&self, leader: bool, fence: u64) {
        let was = self.is_leader.swap(leader, Ordering::AcqRel);
        self.fence_token.store(fence, Ordering::Release);
        if was != leader {
            metrics::LEADER_TRANSITIONS_TOTAL.inc();
        }
    }
}

pub async fn run(
    store: Arc<dyn SchedulerStore>,
    cfg: Config,
    state: Arc<LeaderState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut backoff_ms = cfg.leader_backoff_base_ms;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match store
            .acquire_or_renew_leader(&cfg.instance_id, cfg.leader_lock_ttl_ms)
            .await
        {
            Ok(Some(fence)) => {
                if !state.is_leader() {
                    info!(fence, "acquired leader lock");
                    metrics::LEADER_ACQUIRED_TOTAL.inc();
                }
                state.set(true, fence);
                metrics::LEADER_FENCE_TOKEN.set(fence as i64);
                backoff_ms = cfg.leader_backoff_base_ms;
                metrics::LEADER_BACKOFF_SECONDS.set(0.0);
                let jitter_ms = rand_jitter_ms(cfg.leader_lock_renew_ms / 4);
                sleep_or_shutdown(
                    Duration::from_millis(cfg.leader_lock_renew_ms + jitter_ms),
                    &mut shutdown,
                )
                .await;
            }
            Ok(None) => {
                state.set(false, 0);
                let wait = Duration::from_millis(backoff_ms);
                metrics::LEADER_BACKOFF_SECONDS.set(wait.as_secs_f64());
                sleep_or_shutdown(wait, &mut shutdown).await;
                backoff_ms = (backoff_ms * 2).min(cfg.leader_backoff_max_ms);
            }
            Err(e) => {
                warn!(error = %e, "leader lock renewal failed");
                metrics::LEADER_RENEW_FAILED_TOTAL.inc();
                state.set(false, 0);
                let wait = Duration::from_millis(backoff_ms);
                metrics::LEADER_BACKOFF_SECONDS.set(wait.as_secs_f64());
                sleep_or_shutdown(wait, &mut shutdown).await;
                backoff_ms = (backoff_ms * 2).min(cfg.leader_backoff_max_ms);
            }
        }
    }
    let _ = store.release_leader(&cfg.instance_id).await;
    state.set(false, 0);
    info!("released leader lock on shutdown");
}

async fn sleep_or_shutdown(d: Duration, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(d) => {}
        _ = shutdown.changed() => {}
    }
}

fn rand_jitter_ms(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    use rand::Rng;
    rand::thread_rng().gen_range(0..max)
}
