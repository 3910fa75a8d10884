use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::PipelineError;
use crate::model::TargetSelector;
use crate::orchestrator::Orchestrator;
use crate::pipeline::ManualLink;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/batches", post(start_batch))
        .route("/batches/{request_id}", get(batch_status))
        .route("/batches/{request_id}/posts/{post_id}/logs", get(post_logs))
        .route("/posts/{post_id}/links", post(add_links))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// `PipelineError` as an HTTP response with a JSON `{error, kind}` body.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::NotFound(_) | PipelineError::ConfigurationMissing { .. } => StatusCode::NOT_FOUND,
            PipelineError::ValidationError(_) | PipelineError::TargetUnavailable { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string(), "kind": self.0.kind() }))).into_response()
    }
}

#[derive(Deserialize)]
struct StartReq {
    post_ids: Vec<String>,
    #[serde(default)]
    target: TargetSelector,
    #[serde(default)]
    sync: bool,
}

async fn start_batch(State(state): State<AppState>, Json(body): Json<StartReq>) -> Result<Response, ApiError> {
    let started = state
        .orchestrator
        .start_batch(body.post_ids, body.target, body.sync)
        .await?;
    let code = if body.sync { StatusCode::OK } else { StatusCode::ACCEPTED };
    Ok((code, Json(started)).into_response())
}

async fn batch_status(State(state): State<AppState>, Path(request_id): Path<String>) -> Result<Response, ApiError> {
    let status = state.orchestrator.get_batch_status(&request_id).await?;
    Ok(Json(status).into_response())
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn post_logs(
    State(state): State<AppState>,
    Path((request_id, post_id)): Path<(String, String)>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let lines = state
        .orchestrator
        .get_post_logs(&request_id, &post_id, q.tail)
        .await?;
    Ok(Json(lines))
}

#[derive(Deserialize)]
struct AddLinksReq {
    links: Vec<ManualLink>,
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(default)]
    target: TargetSelector,
}

async fn add_links(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Json(body): Json<AddLinksReq>,
) -> Result<Response, ApiError> {
    let out = state
        .orchestrator
        .add_manual_links(&post_id, &body.links, body.date, &body.target)
        .await?;
    Ok(Json(out).into_response())
}
