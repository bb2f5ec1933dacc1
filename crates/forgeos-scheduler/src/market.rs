//! Market snapshot probes consumed by the dispatch pump. Each probe is
//! independently cached and single-flighted behind a per-key mutex so
//! concurrent cycles for different agents sharing a TTL window collapse
//! onto one upstream fetch instead of stampeding it.

use crate::config::Config;
use crate::metrics;
use forgeos_core::{Result, SchedulerError};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct CacheSlot {
    value: Value,
    fetched_at: Instant,
}

/// One mutex-guarded slot per cache key: holding the lock both protects the
/// slot and serializes concurrent misses onto a single upstream call.
struct SingleFlightCache {
    slots: tokio::sync::Mutex<HashMap<String, std::sync::Arc<Mutex<Option<CacheSlot>>>>>,
}

impl SingleFlightCache {
    fn new() -> Self {
        Self {
            slots: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: &str) -> std::sync::Arc<Mutex<Option<CacheSlot>>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(None)))
            .clone()
    }
}

pub struct MarketClient {
    http: reqwest::Client,
    base: Option<String>,
    timeout: Duration,
    price_ttl: Duration,
    balance_ttl: Duration,
    price_cache: SingleFlightCache,
    dag_cache: SingleFlightCache,
    balance_cache: SingleFlightCache,
}

impl MarketClient {
    pub fn new(cfg: &Config) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(cfg.kas_api_timeout_ms))
                .build()
                .expect("reqwest client"),
            base: cfg.kas_api_base.clone(),
            timeout: Duration::from_millis(cfg.kas_api_timeout_ms),
            price_ttl: Duration::from_millis(cfg.market_cache_ttl_ms),
            balance_ttl: Duration::from_millis(cfg.balance_cache_ttl_ms),
            price_cache: SingleFlightCache::new(),
            dag_cache: SingleFlightCache::new(),
            balance_cache: SingleFlightCache::new(),
        }
    }

    pub async fn price_snapshot(&self) -> Result<Value> {
        self.probe("price", "price", &self.price_cache, self.price_ttl)
            .await
    }

    pub async fn dag_info(&self) -> Result<Value> {
        self.probe("dag_info", "dag_info", &self.dag_cache, self.price_ttl)
            .await
    }

    pub async fn balance(&self, address: &str) -> Result<Value> {
        self.probe(
            "balance",
            &format!("balance/{address}"),
            &self.balance_cache,
            self.balance_ttl,
        )
        .await
    }

    async fn probe(
        &self,
        name: &str,
        path: &str,
        cache: &SingleFlightCache,
        ttl: Duration,
    ) -> Result<Value> {
        let Some(base) = &self.base else {
            return Ok(Value::Null);
        };
        let slot = cache.slot(path).await;
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.fetched_at.elapsed() < ttl {
                metrics::MARKET_CACHE_HITS_TOTAL.with_label_values(&[name]).inc();
                return Ok(existing.value.clone());
            }
        }
        let url = format!("{}/{}", base.trim_end_matches('/'), path);
        let timer = std::time::Instant::now();
        let resp = tokio::time::timeout(self.timeout, self.http.get(&url).send())
            .await
            .map_err(|_| SchedulerError::Internal(format!("{name} probe timed out")))?
            .map_err(|e| SchedulerError::Internal(format!("{name} probe: {e}")))?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| SchedulerError::Internal(format!("{name} decode: {e}")))?;
        metrics::UPSTREAM_LATENCY_SECONDS
            .with_label_values(&[name])
            .observe(timer.elapsed().as_secs_f64());
        *guard = Some(CacheSlot {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }
}
