//! `MemoryStore` — the in-process `SchedulerStore` implementation. Every
//! public method takes the single write lock for its whole body, the same
//! "whole critical section" discipline an atomic Redis script would give us.

use crate::traits::{DueClaim, QueueDepths, SchedulerStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use forgeos_core::{Agent, ExecutionTask, Result, SchedulerError, TaskId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Copy)]
enum IdemState {
    Lease { expires_at: DateTime<Utc> },
    Done { expires_at: DateTime<Utc> },
}

struct ExecLease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, Agent>,
    // due index: score (millis since epoch) -> queue keys due at that score
    due: BTreeMap<i64, HashSet<String>>,
    due_score: HashMap<String, i64>,
    agent_lease: HashMap<String, (String, u64, DateTime<Utc>)>,

    // execution queue
    ready: std::collections::VecDeque<TaskId>,
    processing: std::collections::VecDeque<TaskId>,
    payloads: HashMap<TaskId, ExecutionTask>,
    agent_tasks: HashMap<String, HashSet<TaskId>>,
    exec_lease: HashMap<TaskId, ExecLease>,

    leader: Option<(String, u64, DateTime<Utc>)>,
    leader_fence_seq: u64,

    idem: HashMap<String, (IdemState, String)>,
    idem_token_seq: u64,

    quota: HashMap<String, (i64, u64)>, // key -> (window_start_secs, count)
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    fn next_idem_token(inner: &mut Inner) -> String {
        inner.idem_token_seq += 1;
        format!("idem-lease-{}", inner.idem_token_seq)
    }

    // ---- synchronous WAL-replay helpers -----------------------------------
    // Mirror the async methods above but run outside any executor, so state
    // can be rebuilt from a WAL at startup before tokio is driving anything.

    pub fn replay_put_agent(&self, agent: Agent) {
        let mut inner = self.inner.write();
        inner.agents.insert(agent.queue_key.clone(), agent);
    }

    pub fn replay_schedule(&self, queue_key: &str, next_run_at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        let score = next_run_at.timestamp_millis();
        if let Some(old) = inner.due_score.insert(queue_key.to_string(), score) {
            if let Some(set) = inner.due.get_mut(&old) {
                set.remove(queue_key);
                if set.is_empty() {
                    inner.due.remove(&old);
                }
            }
        }
        inner.due.entry(score).or_default().insert(queue_key.to_string());
    }

    pub fn replay_remove_agent(&self, queue_key: &str) {
        let mut inner = self.inner.write();
        inner.agents.remove(queue_key);
        if let Some(score) = inner.due_score.remove(queue_key) {
            if let Some(set) = inner.due.get_mut(&score) {
                set.remove(queue_key);
                if set.is_empty() {
                    inner.due.remove(&score);
                }
            }
        }
        if let Some(task_ids) = inner.agent_tasks.remove(queue_key) {
            for id in task_ids {
                inner.payloads.remove(&id);
                inner.ready.retain(|t| t != &id);
                inner.processing.retain(|t| t != &id);
            }
        }
    }

    pub fn replay_enqueue_task(&self, task: ExecutionTask) {
        let mut inner = self.inner.write();
        inner
            .agent_tasks
            .entry(task.queue_key.clone())
            .or_default()
            .insert(task.id.clone());
        inner.ready.push_back(task.id.clone());
        inner.payloads.insert(task.id.clone(), task);
    }

    pub fn replay_ack_task(&self, task_id: &str) {
        let mut inner = self.inner.write();
        inner.ready.retain(|t| t != task_id);
        inner.processing.retain(|t| t != task_id);
        inner.exec_lease.remove(task_id);
        if let Some(task) = inner.payloads.remove(task_id) {
            if let Some(set) = inner.agent_tasks.get_mut(&task.queue_key) {
                set.remove(task_id);
            }
        }
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn put_agent(&self, agent: Agent) -> Result<Agent> {
        let mut inner = self.inner.write();
        inner.agents.insert(agent.queue_key.clone(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, queue_key: &str) -> Result<Agent> {
        let inner = self.inner.read();
        inner
            .agents
            .get(queue_key)
            .cloned()
            .ok_or(SchedulerError::NotFound)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let inner = self.inner.read();
        let mut out: Vec<Agent> = inner.agents.values().cloned().collect();
        out.sort_by(|a, b| a.queue_key.cmp(&b.queue_key));
        Ok(out)
    }

    async fn agent_count(&self) -> Result<u64> {
        Ok(self.inner.read().agents.len() as u64)
    }

    async fn update_agent(
        &self,
        queue_key: &str,
        f: Box<dyn FnOnce(&mut Agent) + Send>,
    ) -> Result<Agent> {
        let mut inner = self.inner.write();
        let agent = inner.agents.get_mut(queue_key).ok_or(SchedulerError::NotFound)?;
        f(agent);
        Ok(agent.clone())
    }

    async fn remove_agent(&self, queue_key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.agents.remove(queue_key);
        if let Some(score) = inner.due_score.remove(queue_key) {
            if let Some(set) = inner.due.get_mut(&score) {
                set.remove(queue_key);
                if set.is_empty() {
                    inner.due.remove(&score);
                }
            }
        }
        inner.agent_lease.remove(queue_key);
        if let Some(task_ids) = inner.agent_tasks.remove(queue_key) {
            for id in task_ids {
                if inner.exec_lease.contains_key(&id) {
                    continue; // currently leased: leave it, dispatcher will ack/expire it
                }
                inner.payloads.remove(&id);
                inner.ready.retain(|t| t != &id);
                inner.processing.retain(|t| t != &id);
            }
        }
        Ok(())
    }

    async fn schedule(&self, queue_key: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        let score = next_run_at.timestamp_millis();
        if let Some(old) = inner.due_score.insert(queue_key.to_string(), score) {
            if let Some(set) = inner.due.get_mut(&old) {
                set.remove(queue_key);
                if set.is_empty() {
                    inner.due.remove(&old);
                }
            }
        }
        inner.due.entry(score).or_default().insert(queue_key.to_string());
        Ok(())
    }

    async fn unschedule(&self, queue_key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(score) = inner.due_score.remove(queue_key) {
            if let Some(set) = inner.due.get_mut(&score) {
                set.remove(queue_key);
                if set.is_empty() {
                    inner.due.remove(&score);
                }
            }
        }
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_cap: usize,
        instance_id: &str,
        fence: u64,
        lease_ttl_ms: i64,
    ) -> Result<Vec<DueClaim>> {
        let mut inner = self.inner.write();
        let cutoff = now.timestamp_millis();
        let due_keys: Vec<String> = inner
            .due
            .range(..=cutoff)
            .flat_map(|(_, set)| set.iter().cloned())
            .take(batch_cap)
            .collect();

        let mut claimed = Vec::new();
        for key in due_keys {
            let held = inner
                .agent_lease
                .get(&key)
                .map(|(_, _, exp)| *exp > now)
                .unwrap_or(false);
            if held {
                continue;
            }
            let expires_at = now + Duration::milliseconds(lease_ttl_ms);
            inner
                .agent_lease
                .insert(key.clone(), (instance_id.to_string(), fence, expires_at));
            claimed.push(DueClaim {
                queue_key: key,
                leader_fence_token: fence,
            });
        }
        Ok(claimed)
    }

    async fn due_count(&self, now: DateTime<Utc>) -> Result<u64> {
        let inner = self.inner.read();
        let cutoff = now.timestamp_millis();
        Ok(inner
            .due
            .range(..=cutoff)
            .map(|(_, set)| set.len() as u64)
            .sum())
    }

    async fn enqueue_task(&self, task: ExecutionTask, max_queue_depth: usize) -> Result<()> {
        let mut inner = self.inner.write();
        let depth = inner.ready.len() + inner.processing.len();
        if depth >= max_queue_depth {
            return Err(SchedulerError::SchedulerQueueFull);
        }
        inner
            .agent_tasks
            .entry(task.queue_key.clone())
            .or_default()
            .insert(task.id.clone());
        inner.ready.push_back(task.id.clone());
        inner.payloads.insert(task.id.clone(), task);
        Ok(())
    }

    async fn claim_task(&self, owner: &str, lease_ttl_ms: i64) -> Result<Option<ExecutionTask>> {
        let mut inner = self.inner.write();
        let Some(task_id) = inner.ready.pop_front() else {
            return Ok(None);
        };
        let task = match inner.payloads.get(&task_id) {
            Some(t) => t.clone(),
            None => return Ok(None), // payload vanished under us; drop silently
        };
        inner.processing.push_back(task_id.clone());
        let expires_at = Utc::now() + Duration::milliseconds(lease_ttl_ms);
        inner.exec_lease.insert(
            task_id,
            ExecLease {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(Some(task))
    }

    async fn ack_task(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.processing.retain(|t| t != task_id);
        inner.exec_lease.remove(task_id);
        if let Some(task) = inner.payloads.remove(task_id) {
            if let Some(set) = inner.agent_tasks.get_mut(&task.queue_key) {
                set.remove(task_id);
            }
        }
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskId>> {
        let mut inner = self.inner.write();
        let expired: Vec<TaskId> = inner
            .exec_lease
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .take(limit)
            .collect();
        for id in &expired {
            inner.exec_lease.remove(id);
            inner.processing.retain(|t| t != id);
            if inner.payloads.contains_key(id) {
                inner.ready.push_back(id.clone());
            }
        }
        Ok(expired)
    }

    async fn boot_recover(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut recovered = 0u64;
        {
            let mut inner = self.inner.write();
            // payloads are the source of truth: anything in `processing`
            // without a live lease, or anything orphaned in neither queue,
            // goes back to `ready`.
            let processing_ids: HashSet<TaskId> = inner.processing.iter().cloned().collect();
            let ready_ids: HashSet<TaskId> = inner.ready.iter().cloned().collect();
            let mut to_requeue = Vec::new();
            for id in inner.payloads.keys() {
                let has_live_lease = inner
                    .exec_lease
                    .get(id)
                    .map(|l| l.expires_at > now)
                    .unwrap_or(false);
                let tracked = processing_ids.contains(id) || ready_ids.contains(id);
                if !tracked || (processing_ids.contains(id) && !has_live_lease) {
                    to_requeue.push(id.clone());
                }
            }
            for id in to_requeue {
                inner.processing.retain(|t| t != &id);
                inner.exec_lease.remove(&id);
                if !inner.ready.contains(&id) {
                    inner.ready.push_back(id.clone());
                }
                recovered += 1;
            }
        }
        recovered += self.requeue_expired(now, usize::MAX).await?.len() as u64;
        Ok(recovered)
    }

    async fn queue_depths(&self) -> Result<QueueDepths> {
        let inner = self.inner.read();
        Ok(QueueDepths {
            ready: inner.ready.len() as u64,
            processing: inner.processing.len() as u64,
            inflight: inner.exec_lease.len() as u64,
        })
    }

    async fn acquire_or_renew_leader(
        &self,
        instance_id: &str,
        lock_ttl_ms: i64,
    ) -> Result<Option<u64>> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let expires_at = now + Duration::milliseconds(lock_ttl_ms);
        match &inner.leader {
            Some((owner, fence, exp)) if *exp > now => {
                if owner == instance_id {
                    let fence = *fence;
                    inner.leader = Some((instance_id.to_string(), fence, expires_at));
                    Ok(Some(fence))
                } else {
                    Ok(None)
                }
            }
            _ => {
                inner.leader_fence_seq += 1;
                let fence = inner.leader_fence_seq;
                inner.leader = Some((instance_id.to_string(), fence, expires_at));
                Ok(Some(fence))
            }
        }
    }

    async fn release_leader(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some((owner, _, _)) = &inner.leader {
            if owner == instance_id {
                inner.leader = None;
            }
        }
        Ok(())
    }

    async fn idem_begin(&self, key: &str, lease_ttl_ms: i64) -> Result<(bool, String)> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        if let Some((state, _)) = inner.idem.get(key) {
            match state {
                IdemState::Done { expires_at } if *expires_at > now => return Ok((false, String::new())),
                IdemState::Lease { expires_at } if *expires_at > now => return Ok((false, String::new())),
                _ => {}
            }
        }
        let token = MemoryStore::next_idem_token(&mut inner);
        let expires_at = now + Duration::milliseconds(lease_ttl_ms);
        inner
            .idem
            .insert(key.to_string(), (IdemState::Lease { expires_at }, token.clone()));
        Ok((true, token))
    }

    async fn idem_complete(&self, key: &str, token: &str, done_ttl_ms: i64) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.idem.get(key) {
            Some((IdemState::Lease { .. }, cur_token)) if cur_token == token => {
                let expires_at = Utc::now() + Duration::milliseconds(done_ttl_ms);
                inner.idem.insert(
                    key.to_string(),
                    (IdemState::Done { expires_at }, token.to_string()),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn idem_release(&self, key: &str, token: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some((IdemState::Lease { .. }, cur_token)) = inner.idem.get(key) {
            if cur_token == token {
                inner.idem.remove(key);
            }
        }
        Ok(())
    }

    async fn quota_check(
        &self,
        subject: &str,
        bucket: &str,
        window_secs: i64,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let window_start = (now.timestamp() / window_secs) * window_secs;
        let key = format!("{subject}:{bucket}");
        let entry = inner.quota.entry(key).or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        if entry.1 >= limit {
            return Ok(false);
        }
        entry.1 += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeos_core::AgentStatus;

    fn agent(key: &str) -> Agent {
        let now = Utc::now();
        Agent {
            user_id: "u1".into(),
            agent_id: key.into(),
            queue_key: format!("u1:{key}"),
            display_name: "d".into(),
            wallet_address: "kaspa:abc".into(),
            status: AgentStatus::Running,
            cycle_interval_ms: 5000,
            callback_url: None,
            strategy_label: "s".into(),
            created_at: now,
            updated_at: now,
            last_cycle_at: None,
            next_run_at: now,
            failure_count: 0,
            queue_pending: false,
            last_dispatch: None,
        }
    }

    #[tokio::test]
    async fn claim_due_only_returns_unleased_keys() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.put_agent(agent("a1")).await.unwrap();
        store.schedule("u1:a1", now - Duration::seconds(1)).await.unwrap();
        let first = store.claim_due(now, 10, "inst-a", 1, 30_000).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.claim_due(now, 10, "inst-b", 2, 30_000).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn leader_lock_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let fence_a = store.acquire_or_renew_leader("a", 10_000).await.unwrap();
        assert!(fence_a.is_some());
        let fence_b = store.acquire_or_renew_leader("b", 10_000).await.unwrap();
        assert!(fence_b.is_none());
    }

    #[tokio::test]
    async fn leader_fence_token_increases_only_on_fresh_acquire() {
        let store = MemoryStore::new();
        let f1 = store.acquire_or_renew_leader("a", 10).await.unwrap().unwrap();
        let f2 = store.acquire_or_renew_leader("a", 10).await.unwrap().unwrap();
        assert_eq!(f1, f2);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let f3 = store.acquire_or_renew_leader("b", 10).await.unwrap().unwrap();
        assert!(f3 > f2);
    }

    #[tokio::test]
    async fn idem_begin_then_complete_then_repeat_is_skipped() {
        let store = MemoryStore::new();
        let (send, token) = store.idem_begin("k1", 30_000).await.unwrap();
        assert!(send);
        assert!(store.idem_complete("k1", &token, 60_000).await.unwrap());
        let (send_again, _) = store.idem_begin("k1", 30_000).await.unwrap();
        assert!(!send_again);
    }

    #[tokio::test]
    async fn enqueue_claim_ack_round_trip() {
        let store = MemoryStore::new();
        let task = ExecutionTask::new_cycle("u1:a1".into(), 1, "inst".into());
        store.enqueue_task(task.clone(), 100).await.unwrap();
        let claimed = store.claim_task("inst", 30_000).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        store.ack_task(&task.id).await.unwrap();
        assert_eq!(store.queue_depths().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn remove_agent_drops_its_unleased_tasks() {
        let store = MemoryStore::new();
        store.put_agent(agent("a1")).await.unwrap();
        let task = ExecutionTask::new_cycle("u1:a1".into(), 1, "inst".into());
        store.enqueue_task(task, 100).await.unwrap();
        store.remove_agent("u1:a1").await.unwrap();
        assert_eq!(store.queue_depths().await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn quota_check_resets_on_new_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store.quota_check("s", "b", 60, 1, now).await.unwrap());
        assert!(!store.quota_check("s", "b", 60, 1, now).await.unwrap());
        let later = now + Duration::seconds(61);
        assert!(store.quota_check("s", "b", 60, 1, later).await.unwrap());
    }
}
