//! `SchedulerStore` is the shared-state-store abstraction: a durable
//! map/sorted-set/list/CAS substrate used by every other scheduler-core
//! component. Every mutation that touches more than one of the underlying
//! structures is exposed as a single trait method so an implementation can
//! run it as one atomic unit (a Lua-style script against a real Redis, or
//! — as here — one write-lock critical section against an in-process
//! structure). No caller is ever handed a multi-step sequence to perform
//! itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeos_core::{Agent, ExecutionTask, Result, TaskId};

#[derive(Debug, Clone)]
pub struct DueClaim {
    pub queue_key: String,
    pub leader_fence_token: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueDepths {
    pub ready: u64,
    pub processing: u64,
    pub inflight: u64,
}

#[async_trait]
pub trait SchedulerStore: Send + Sync + 'static {
    // ---- agent registry -----------------------------------------------------
    async fn put_agent(&self, agent: Agent) -> Result<Agent>;
    async fn get_agent(&self, queue_key: &str) -> Result<Agent>;
    async fn list_agents(&self) -> Result<Vec<Agent>>;
    async fn agent_count(&self) -> Result<u64>;
    /// Applies `f` to the current record under the store's single write
    /// lock and persists the result — the in-process analogue of a
    /// read-modify-write Lua script. Boxed rather than generic so the
    /// trait stays object-safe behind `Arc<dyn SchedulerStore>`.
    async fn update_agent(
        &self,
        queue_key: &str,
        f: Box<dyn FnOnce(&mut Agent) + Send>,
    ) -> Result<Agent>;
    /// Removes the agent, its due-index entry/lease, and every task it
    /// still owns that isn't currently leased.
    async fn remove_agent(&self, queue_key: &str) -> Result<()>;

    // ---- due-agent index ----------------------------------------------------
    async fn schedule(&self, queue_key: &str, next_run_at: DateTime<Utc>) -> Result<()>;
    async fn unschedule(&self, queue_key: &str) -> Result<()>;
    /// Scans the due index for `score <= now`, up to `batch_cap` entries,
    /// and attempts to lease each one; returns only the keys this call
    /// actually claimed.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_cap: usize,
        instance_id: &str,
        fence: u64,
        lease_ttl_ms: i64,
    ) -> Result<Vec<DueClaim>>;
    async fn due_count(&self, now: DateTime<Utc>) -> Result<u64>;

    // ---- execution queue ----------------------------------------------------
    async fn enqueue_task(&self, task: ExecutionTask, max_queue_depth: usize) -> Result<()>;
    async fn claim_task(&self, owner: &str, lease_ttl_ms: i64) -> Result<Option<ExecutionTask>>;
    async fn ack_task(&self, task_id: &str) -> Result<()>;
    /// Returns the ids moved back to `ready`.
    async fn requeue_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskId>>;
    /// Runs on startup: rebuilds owner/agent-task indexes from `payloads`
    /// (source of truth), reclaims orphaned `processing` entries lacking a
    /// live lease back to `ready`, drops entries whose payload vanished,
    /// then runs `requeue_expired`. Returns the count of tasks recovered.
    async fn boot_recover(&self, now: DateTime<Utc>) -> Result<u64>;
    async fn queue_depths(&self) -> Result<QueueDepths>;

    // ---- leader lock --------------------------------------------------------
    /// Returns `Some(fence)` if this call acquired or is still renewing
    /// leadership under `instance_id`; `None` if another instance holds the
    /// lock. Fence increases only on a fresh acquisition.
    async fn acquire_or_renew_leader(
        &self,
        instance_id: &str,
        lock_ttl_ms: i64,
    ) -> Result<Option<u64>>;
    async fn release_leader(&self, instance_id: &str) -> Result<()>;

    // ---- callback idempotency -----------------------------------------------
    async fn idem_begin(&self, key: &str, lease_ttl_ms: i64) -> Result<(bool, String)>;
    async fn idem_complete(&self, key: &str, token: &str, done_ttl_ms: i64) -> Result<bool>;
    async fn idem_release(&self, key: &str, token: &str) -> Result<()>;

    // ---- quota --------------------------------------------------------------
    /// Atomic INCR+EXPIRE-on-first against `subject:bucket:window`;
    /// returns `true` if the call is within `limit` for the current window.
    async fn quota_check(
        &self,
        subject: &str,
        bucket: &str,
        window_secs: i64,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}
