//! Dispatch pump: a bounded worker pool that claims tasks off the execution
//! queue, hydrates a market snapshot, posts the agent's callback under an
//! idempotency key, and acks the task in all outcomes.

use crate::config::Config;
use crate::market::MarketClient;
use crate::metrics;
use chrono::{Duration as ChronoDuration, Utc};
use forgeos_core::{Agent, LastDispatch};
use forgeos_store::SchedulerStore;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, warn};

pub struct DispatchPump {
    store: Arc<dyn SchedulerStore>,
    market: Arc<MarketClient>,
    http: reqwest::Client,
    cfg: Config,
    semaphore: Arc<Semaphore>,
}

impl DispatchPump {
    pub fn new(store: Arc<dyn SchedulerStore>, market: Arc<MarketClient>, cfg: Config) -> Self {
        let semaphore = Arc::new(Semaphore::new(cfg.cycle_concurrency));
        Self {
            store,
            market,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(cfg.callback_timeout_ms))
                .build()
                .expect("reqwest client"),
            cfg,
            semaphore,
        }
    }

    /// Runs until `shutdown` fires, claiming one task per free worker slot.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(25)) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };
            match self
                .store
                .claim_task(&self.cfg.instance_id, self.cfg.exec_lease_ttl_ms)
                .await
            {
                Ok(Some(task)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.process(task).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "claim_task failed");
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn process(&self, task: forgeos_core::ExecutionTask) {
        metrics::DISPATCH_TOTAL.with_label_values(&["started"]).inc();
        let result = self.dispatch_once(&task).await;
        match &result {
            Ok(()) => metrics::DISPATCH_TOTAL.with_label_values(&["completed"]).inc(),
            Err(e) => {
                warn!(error = %e, queue_key = %task.queue_key, "dispatch failed");
                metrics::DISPATCH_TOTAL.with_label_values(&["failed"]).inc();
            }
        }
        if let Err(e) = self.store.ack_task(&task.id).await {
            error!(error = %e, task_id = %task.id, "ack_task failed");
        }
    }

    async fn dispatch_once(&self, task: &forgeos_core::ExecutionTask) -> forgeos_core::Result<()> {
        let agent = self.store.get_agent(&task.queue_key).await?;
        if !agent.is_running() {
            return Ok(());
        }
        // No callback URL: counted as a successful dispatch with no
        // idempotency lease taken (ambiguous source behavior preserved, not
        // reinterpreted — see design notes on absent-callback handling).
        let Some(callback_url) = agent.callback_url.clone() else {
            self.record_outcome(&agent, true, None).await?;
            return Ok(());
        };

        let market = self.build_snapshot(&agent).await;
        let idem_key = format!(
            "forgeos.scheduler:{}:{}:{}",
            task.queue_key, task.leader_fence_token, task.id
        );
        let (should_send, token) = self
            .store
            .idem_begin(&idem_key, self.cfg.callback_idempotency_lease_ttl_ms)
            .await?;

        if !should_send {
            metrics::CALLBACK_TOTAL.with_label_values(&["dedupe_skipped"]).inc();
            return Ok(());
        }

        let body = serde_json::json!({
            "event": "agent_cycle",
            "ts": Utc::now(),
            "scheduler": {
                "instanceId": self.cfg.instance_id,
                "leaderFenceToken": task.leader_fence_token,
                "queueTaskId": task.id,
                "callbackIdempotencyKey": idem_key,
            },
            "agent": {
                "id": agent.agent_id,
                "userId": agent.user_id,
                "name": agent.display_name,
                "strategyLabel": agent.strategy_label,
                "cycleIntervalMs": agent.cycle_interval_ms,
            },
            "market": market,
        });

        let timer = std::time::Instant::now();
        let outcome = self
            .http
            .post(&callback_url)
            .header("X-ForgeOS-Scheduler-Instance", &self.cfg.instance_id)
            .header("X-ForgeOS-Leader-Fence-Token", task.leader_fence_token.to_string())
            .header("X-ForgeOS-Idempotency-Key", &idem_key)
            .header("X-ForgeOS-Queue-Task-Id", &task.id)
            .header("X-ForgeOS-Agent-Key", &task.queue_key)
            .json(&body)
            .send()
            .await;

        let success = matches!(&outcome, Ok(resp) if resp.status().is_success());
        metrics::CALLBACK_LATENCY_SECONDS
            .with_label_values(&[if success { "ok" } else { "error" }])
            .observe(timer.elapsed().as_secs_f64());

        if success {
            metrics::CALLBACK_TOTAL.with_label_values(&["success"]).inc();
            self.store
                .idem_complete(&idem_key, &token, self.cfg.callback_idempotency_done_ttl_ms)
                .await?;
        } else {
            metrics::CALLBACK_TOTAL.with_label_values(&["error"]).inc();
            self.store.idem_release(&idem_key, &token).await?;
        }

        self.record_outcome(&agent, success, outcome.err().map(|e| e.to_string()))
            .await?;
        Ok(())
    }

    async fn build_snapshot(&self, agent: &Agent) -> serde_json::Value {
        let price = self.market.price_snapshot().await.unwrap_or(serde_json::Value::Null);
        let dag = self.market.dag_info().await.unwrap_or(serde_json::Value::Null);
        let balance = self
            .market
            .balance(&agent.wallet_address)
            .await
            .unwrap_or(serde_json::Value::Null);
        serde_json::json!({
            "priceUsd": price,
            "dag": dag,
            "walletKas": balance,
        })
    }

    async fn record_outcome(
        &self,
        agent: &Agent,
        success: bool,
        error: Option<String>,
    ) -> forgeos_core::Result<()> {
        let queue_key = agent.queue_key.clone();
        let delay_ms = if success {
            agent.cycle_interval_ms
        } else {
            agent.cycle_interval_ms.min(5_000)
        };
        let next_run_at = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
        let updated = self
            .store
            .update_agent(
                &queue_key,
                Box::new(move |a: &mut Agent| {
                    a.last_cycle_at = Some(Utc::now());
                    a.next_run_at = next_run_at;
                    a.queue_pending = false;
                    a.updated_at = Utc::now();
                    if success {
                        a.failure_count = 0;
                    } else {
                        a.failure_count += 1;
                    }
                    a.last_dispatch = Some(LastDispatch {
                        ts: Utc::now(),
                        success,
                        error: error.clone(),
                    });
                }),
            )
            .await?;
        if updated.is_running() {
            self.store.schedule(&queue_key, next_run_at).await?;
        }
        Ok(())
    }
}
