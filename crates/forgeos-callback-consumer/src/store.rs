//! In-process state for the callback consumer: per-`agentKey` fence
//! watermark, idempotency SET-NX map, a ring buffer of recently accepted
//! events, and a receipt LRU backed by a long-lived persistent map.

use crate::config::Config;
use chrono::{DateTime, Utc};
use forgeos_core::ExecutionReceipt;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

pub struct ConsumerStore {
    cfg: Config,
    fences: RwLock<HashMap<String, u64>>,
    idempotency: RwLock<HashMap<String, DateTime<Utc>>>,
    events: RwLock<VecDeque<serde_json::Value>>,
    receipts_lru: RwLock<LruCache<String, ExecutionReceipt>>,
    receipts_persistent: RwLock<HashMap<String, ExecutionReceipt>>,
}

impl ConsumerStore {
    pub fn new(cfg: Config) -> Self {
        let cap = NonZeroUsize::new(cfg.receipt_lru_cap.max(1)).unwrap();
        Self {
            fences: RwLock::new(HashMap::new()),
            idempotency: RwLock::new(HashMap::new()),
            events: RwLock::new(VecDeque::with_capacity(cfg.ring_buffer_cap)),
            receipts_lru: RwLock::new(LruCache::new(cap)),
            receipts_persistent: RwLock::new(HashMap::new()),
            cfg,
        }
    }

    fn gc_idempotency(&self, map: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) {
        map.retain(|_, expires| *expires > now);
    }

    /// `SET-NX` with a 24h TTL: returns `true` if this call claimed the key
    /// (i.e. it was not already present).
    pub fn idempotency_claim(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut map = self.idempotency.write();
        self.gc_idempotency(&mut map, now);
        if map.contains_key(key) {
            return false;
        }
        map.insert(
            key.to_string(),
            now + chrono::Duration::seconds(self.cfg.idempotency_ttl_secs),
        );
        true
    }

    /// Returns the current fence for `agent_key`, and bumps it if `received`
    /// is strictly greater.
    pub fn check_and_advance_fence(&self, agent_key: &str, received: u64) -> Result<(), u64> {
        let mut fences = self.fences.write();
        let current = *fences.get(agent_key).unwrap_or(&0);
        if received < current {
            return Err(current);
        }
        if received > current {
            fences.insert(agent_key.to_string(), received);
        }
        Ok(())
    }

    pub fn push_event(&self, event: serde_json::Value) {
        let mut events = self.events.write();
        if events.len() >= self.cfg.ring_buffer_cap {
            events.pop_front();
        }
        events.push_back(event);
        crate::metrics::EVENTS_RING_SIZE.set(events.len() as i64);
    }

    pub fn recent_events(&self) -> Vec<serde_json::Value> {
        self.events.read().iter().cloned().collect()
    }

    /// Returns the local LRU copy first, falling back to the persistent map.
    pub fn get_receipt(&self, txid: &str) -> Option<ExecutionReceipt> {
        if let Some(r) = self.receipts_lru.write().get(txid) {
            return Some(r.clone());
        }
        self.receipts_persistent.read().get(txid).cloned()
    }

    pub fn upsert_receipt(&self, receipt: ExecutionReceipt) {
        self.receipts_lru
            .write()
            .put(receipt.txid.clone(), receipt.clone());
        self.receipts_persistent
            .write()
            .insert(receipt.txid.clone(), receipt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConsumerStore {
        ConsumerStore::new(Config::from_env())
    }

    #[test]
    fn idempotency_claim_is_single_shot() {
        let s = store();
        assert!(s.idempotency_claim("k1"));
        assert!(!s.idempotency_claim("k1"));
    }

    #[test]
    fn fence_rejects_stale_and_advances_on_increase() {
        let s = store();
        assert!(s.check_and_advance_fence("user1:agent1", 10).is_ok());
        assert_eq!(s.check_and_advance_fence("user1:agent1", 9), Err(10));
        assert!(s.check_and_advance_fence("user1:agent1", 11).is_ok());
        assert_eq!(s.check_and_advance_fence("user1:agent1", 10), Err(11));
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let mut cfg = Config::from_env();
        cfg.ring_buffer_cap = 2;
        let s = ConsumerStore::new(cfg);
        s.push_event(serde_json::json!({"n": 1}));
        s.push_event(serde_json::json!({"n": 2}));
        s.push_event(serde_json::json!({"n": 3}));
        let events = s.recent_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["n"], 2);
    }

    #[test]
    fn receipt_lookup_prefers_lru_copy() {
        let s = store();
        let receipt = ExecutionReceipt {
            txid: "a".repeat(64),
            agent_key: None,
            status: "confirmed".to_string(),
            confirmations: 1,
            fee_kas: None,
            fee_sompi: None,
            broadcast_ts: None,
            confirm_ts: None,
            confirm_ts_source: None,
            slippage_kas: None,
            price_at_broadcast_usd: None,
            price_at_confirm_usd: None,
            source: "tx-builder-bridge".to_string(),
            updated_at: Utc::now(),
        };
        s.upsert_receipt(receipt.clone());
        let fetched = s.get_receipt(&receipt.txid).unwrap();
        assert_eq!(fetched.status, "confirmed");
    }
}
