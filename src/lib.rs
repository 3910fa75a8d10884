// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod batch;
pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod fingerprint;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod section;
pub mod targets;
pub mod telemetry;

pub use crate::api::{router, AppState};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::orchestrator::Orchestrator;

use anyhow::Result;
use axum::Router;

/// Build the full service router from config: the API plus `/metrics`.
/// `metrics` is the installed recorder; pass `Metrics::detached()` in tests.
pub fn app(cfg: &config::AppConfig, metrics: &metrics::Metrics) -> Result<Router> {
    let config_path = config::AppConfig::default_path()?;
    let orchestrator = Orchestrator::from_app_config(cfg, config_path)?;
    Ok(router(AppState { orchestrator }).merge(metrics.router()))
}
