//! linkpost-sync service entrypoint.
//! Loads config, wires the orchestrator and serves the HTTP API.

use anyhow::Context;
use linkpost_sync::{config::AppConfig, metrics::Metrics, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    telemetry::init();

    let cfg = AppConfig::load_default().context("loading service config")?;
    let metrics = Metrics::install()?;
    let app = linkpost_sync::app(&cfg, &metrics)?;

    let listener = tokio::net::TcpListener::bind(&cfg.service.bind)
        .await
        .with_context(|| format!("binding {}", cfg.service.bind))?;
    info!(bind = %cfg.service.bind, posts = cfg.posts.len(), sites = cfg.sites.len(), "linkpost-sync listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
