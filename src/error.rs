//! Failure taxonomy for the per-post pipeline.
//!
//! A low-confidence AI result is not an error; see `extract::ai::AiOutcome`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed for {url}: {reason}")]
    FetchFailure { url: String, reason: String },

    #[error("no usable links extracted for post {post_id}")]
    ExtractionFailure { post_id: String },

    #[error("write to site {site} failed: {reason}")]
    MutationFailure { site: String, reason: String },

    #[error("no configuration for post {post_id}")]
    ConfigurationMissing { post_id: String },

    #[error("invalid input: {0}")]
    ValidationError(String),

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("no target resolved for post {post_id}: {reason}")]
    TargetUnavailable { post_id: String, reason: String },

    /// Unknown batch request, or a post that is not part of it.
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Short machine-readable kind, used in logs and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchFailure { .. } => "fetch_failure",
            Self::ExtractionFailure { .. } => "extraction_failure",
            Self::MutationFailure { .. } => "mutation_failure",
            Self::ConfigurationMissing { .. } => "configuration_missing",
            Self::ValidationError(_) => "validation_error",
            Self::Timeout { .. } => "timeout",
            Self::TargetUnavailable { .. } => "target_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Run `fut` under a per-call deadline; elapsed deadlines become `Timeout`.
pub async fn with_timeout<T, F>(stage: &'static str, secs: u64, fut: F) -> PipelineResult<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(std::time::Duration::from_secs(secs), fut).await {
        Ok(res) => res.map_err(PipelineError::Internal),
        Err(_) => Err(PipelineError::Timeout { stage, secs }),
    }
}
