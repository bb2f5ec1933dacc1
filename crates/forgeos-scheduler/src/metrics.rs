//! Prometheus surface. Registered once into the default registry at startup
//! and scraped at `GET /metrics`, the usual `Lazy` + `register_*!` idiom.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    CounterVec, Gauge, GaugeVec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

const LATENCY_BUCKETS: &[f64] = &[
    0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0,
];

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("http_requests_total", "HTTP requests by route/status", &["route", "status"]).unwrap()
});

pub static SCHEDULER_TICKS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("scheduler_ticks_total", "Scheduler tick loops run").unwrap());

pub static DUE_AGENTS: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("due_agents", "Agents due as of last scan").unwrap());

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("queue_depth", "Execution queue depth by state", &["state"]).unwrap()
});

pub static DISPATCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("dispatch_total", "Dispatch attempts by outcome", &["outcome"]).unwrap()
});

pub static CALLBACK_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("callback_total", "Callback POSTs by outcome", &["outcome"]).unwrap()
});

pub static LEADER_ACQUIRED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("leader_acquired_total", "Leader acquisitions").unwrap());

pub static LEADER_RENEW_FAILED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("leader_renew_failed_total", "Leader renewal failures").unwrap());

pub static LEADER_TRANSITIONS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("leader_transitions_total", "Leadership state changes").unwrap());

pub static LEADER_FENCE_TOKEN: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("leader_fence_token", "Current leader fence token").unwrap());

pub static LEADER_BACKOFF_SECONDS: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("leader_backoff_seconds", "Current re-acquisition backoff").unwrap());

pub static STORE_OPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("store_ops_total", "Store operations by op", &["op"]).unwrap()
});

pub static STORE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("store_errors_total", "Store operation errors by op", &["op"]).unwrap()
});

pub static AUTH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("auth_total", "Authentication attempts by result", &["result"]).unwrap()
});

pub static QUOTA_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("quota_rejected_total", "Requests rejected by quota, by bucket", &["bucket"]).unwrap()
});

pub static JWKS_FETCH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("jwks_fetch_total", "JWKS/OIDC fetches by result", &["result"]).unwrap()
});

pub static UPSTREAM_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "upstream_latency_seconds",
        "Upstream market-probe latency",
        &["probe"],
        LATENCY_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static CALLBACK_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "callback_latency_seconds",
        "Callback POST latency",
        &["outcome"],
        LATENCY_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static BOOT_RECOVERY_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("boot_recovery_total", "Tasks recovered at boot").unwrap());

pub static MARKET_CACHE_HITS_TOTAL: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!("market_cache_hits_total", "Cache hits by probe", &["probe"]).unwrap()
});

/// Forces all lazily-registered metrics into the default registry at
/// startup so `/metrics` is non-empty before first traffic.
pub fn init() {
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&SCHEDULER_TICKS_TOTAL);
    Lazy::force(&DUE_AGENTS);
    Lazy::force(&QUEUE_DEPTH);
    Lazy::force(&DISPATCH_TOTAL);
    Lazy::force(&CALLBACK_TOTAL);
    Lazy::force(&LEADER_ACQUIRED_TOTAL);
    Lazy::force(&LEADER_RENEW_FAILED_TOTAL);
    Lazy::force(&LEADER_TRANSITIONS_TOTAL);
    Lazy::force(&LEADER_FENCE_TOKEN);
    Lazy::force(&LEADER_BACKOFF_SECONDS);
    Lazy::force(&STORE_OPS_TOTAL);
    Lazy::force(&STORE_ERRORS_TOTAL);
    Lazy::force(&AUTH_TOTAL);
    Lazy::force(&QUOTA_REJECTED_TOTAL);
    Lazy::force(&JWKS_FETCH_TOTAL);
    Lazy::force(&UPSTREAM_LATENCY_SECONDS);
    Lazy::force(&CALLBACK_LATENCY_SECONDS);
    Lazy::force(&BOOT_RECOVERY_TOTAL);
    Lazy::force(&MARKET_CACHE_HITS_TOTAL);
}
