mod config;
mod log;
mod metrics;
mod routes;
mod signer;

use config::Config;
use routes::SignerState;
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
    info!(port = cfg.port, "starting forgeos-audit-signer");

    let signer = Arc::new(signer::Signer::from_config(&cfg)?);
    let log = match &cfg.append_log_path {
        Some(path) => Some(Arc::new(log::AuditLog::open(path.clone())?)),
        None => None,
    };

    let app = routes::router(SignerState { signer, log });
    let addr: std::net::SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!(%addr, "listening");
    axum_server::bind(addr).serve(app.into_make_service()).await?;
    Ok(())
}
