//! Due-agent index drain loop. Runs on every replica but is only productive
//! on the leader: `claim_due` itself is a no-op for non-leaders because the
//! store gates leases on a valid fence token.

use crate::config::Config;
use crate::leader::LeaderState;
use crate::metrics;
use chrono::Utc;
use forgeos_core::ExecutionTask;
use forgeos_store::SchedulerStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

static TICK_INFLIGHT: AtomicBool = AtomicBool::new(false);

pub async fn run(
    store: Arc<dyn SchedulerStore>,
    leader: Arc<LeaderState>,
    cfg: Config,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(cfg.tick_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        if !leader.is_leader() {
            continue;
        }
        // Single-flight guard: skip this tick if the previous one is still
        // draining (a slow `enqueue_task` burst shouldn't pile up ticks).
        if TICK_INFLIGHT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        let result = drain_once(&store, &leader, &cfg).await;
        TICK_INFLIGHT.store(false, Ordering::Release);
        if let Err(e) = result {
            warn!(error = %e, "tick drain failed");
        }
        metrics::SCHEDULER_TICKS_TOTAL.inc();
    }
}

/// Drains the due index once outside the regular interval, for the
/// `POST /v1/scheduler/tick` escape hatch.
pub async fn force_once(
    store: &Arc<dyn SchedulerStore>,
    leader: &Arc<LeaderState>,
    cfg: &Config,
) -> forgeos_core::Result<()> {
    let r = drain_once(store, leader, cfg).await;
    metrics::SCHEDULER_TICKS_TOTAL.inc();
    r
}

async fn drain_once(
    store: &Arc<dyn SchedulerStore>,
    leader: &Arc<LeaderState>,
    cfg: &Config,
) -> forgeos_core::Result<()> {
    let now = Utc::now();
    metrics::DUE_AGENTS.set(store.due_count(now).await? as i64);
    let claims = store
        .claim_due(
            now,
            cfg.cycle_concurrency.max(1) * 4,
            &cfg.instance_id,
            leader.fence_token(),
            cfg.due_lease_ttl_ms,
        )
        .await?;
    for claim in claims {
        let task = ExecutionTask::new_cycle(
            claim.queue_key.clone(),
            claim.leader_fence_token,
            cfg.instance_id.clone(),
        );
        match store.enqueue_task(task, cfg.max_queue_depth).await {
            Ok(()) => {
                let _ = store
                    .update_agent(
                        &claim.queue_key,
                        Box::new(|a| a.queue_pending = true),
                    )
                    .await;
            }
            Err(e) => warn!(error = %e, queue_key = %claim.queue_key, "enqueue_task failed"),
        }
    }
    let depths = store.queue_depths().await?;
    metrics::QUEUE_DEPTH.with_label_values(&["ready"]).set(depths.ready as i64);
    metrics::QUEUE_DEPTH.with_label_values(&["processing"]).set(depths.processing as i64);
    metrics::QUEUE_DEPTH.with_label_values(&["inflight"]).set(depths.inflight as i64);
    store.requeue_expired(now, 1000).await?;
    Ok(())
}
