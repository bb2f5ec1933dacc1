mod auth;
mod config;
mod dispatch;
mod leader;
mod market;
mod metrics;
mod quota;
mod routes;
mod state;
mod tick;

use config::Config;
use forgeos_store::{DurableStore, MemoryStore, SchedulerStore};
use leader::LeaderState;
use opentelemetry_otlp::WithExportConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    metrics::init();

    let cfg = Config::from_env();
    info!(instance_id = %cfg.instance_id, "starting forgeos-scheduler");

    let store: Arc<dyn SchedulerStore> = if let Some(dir) = cfg.data_dir.clone() {
        match DurableStore::open(dir) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                tracing::warn!("persistent open failed: {} — falling back to memory", e);
                Arc::new(MemoryStore::new())
            }
        }
    } else {
        Arc::new(MemoryStore::new())
    };

    let recovered = store.boot_recover(chrono::Utc::now()).await?;
    if recovered > 0 {
        info!(recovered, "boot recovery reclaimed orphaned tasks");
        metrics::BOOT_RECOVERY_TOTAL.inc_by(recovered);
    }

    let jwks = if let Some(url) = cfg.jwks_url.clone() {
        Some(Arc::new(auth::JwksCache::new(url)))
    } else {
        cfg.oidc_issuer
            .clone()
            .map(|issuer| Arc::new(auth::JwksCache::from_oidc_issuer(issuer)))
    };

    let leader_state = Arc::new(LeaderState::default());
    let market_client = Arc::new(market::MarketClient::new(&cfg));
    let dispatch_pump = Arc::new(dispatch::DispatchPump::new(
        store.clone(),
        market_client,
        cfg.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let leader_task = tokio::spawn(leader::run(
        store.clone(),
        cfg.clone(),
        leader_state.clone(),
        shutdown_rx.clone(),
    ));
    let tick_task = tokio::spawn(tick::run(
        store.clone(),
        leader_state.clone(),
        cfg.clone(),
        shutdown_rx.clone(),
    ));
    let dispatch_task = tokio::spawn(dispatch_pump.clone().run(shutdown_rx.clone()));

    let app_state = state::AppState {
        store: store.clone(),
        cfg: cfg.clone(),
        leader: leader_state.clone(),
        jwks,
    };
    let app = routes::router(app_state).layer(
        tower_http::trace::TraceLayer::new_for_http(),
    );

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    let use_tls = cfg.tls_cert_path.is_some() && cfg.tls_key_path.is_some();
    let server_task = if use_tls {
        let cert = std::fs::read(cfg.tls_cert_path.as_ref().unwrap())?;
        let key = std::fs::read(cfg.tls_key_path.as_ref().unwrap())?;
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(cert, key).await?;
        tokio::spawn(async move {
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
        })
    } else {
        tokio::spawn(async move { axum_server::bind(addr).serve(app.into_make_service()).await })
    };

    info!(%addr, tls = use_tls, "listening");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Structured shutdown: stop timers, release the leader lock, then let
    // the HTTP server and background tasks drain.
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(leader_task, tick_task, dispatch_task);
    server_task.abort();

    Ok(())
}

fn init_tracing() {
    let otlp = std::env::var("OTLP_ENDPOINT").ok();
    if let Some(endpoint) = otlp {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .ok();
        if let Some(tracer) = tracer {
            let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
            let subscriber = tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(telemetry);
            tracing::subscriber::set_global_default(subscriber).ok();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter("info")
        .init();
}
