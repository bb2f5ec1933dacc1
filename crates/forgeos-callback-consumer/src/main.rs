mod config;
mod metrics;
mod routes;
mod store;

use config::Config;
use std::sync::Arc;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter("info")
        .init();
    metrics::init();

    let cfg = Config::from_env();
    info!(port = cfg.port, "starting forgeos-callback-consumer");

    let store = Arc::new(store::ConsumerStore::new(cfg.clone()));
    let app = routes::router(store, cfg.clone());

    let addr: std::net::SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!(%addr, "listening");
    axum_server::bind(addr).serve(app.into_make_service()).await?;
    Ok(())
}
