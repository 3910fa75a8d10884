//! # Batch orchestrator
//! Admits post pipelines through a fixed-size gate and tracks them by
//! request id. The same state machine runs whether the caller awaits the
//! batch or detaches it and polls.

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use metrics::{describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::batch::{BatchRecord, BatchStore, FileBatchStore, MemoryBatchStore, PostStatus, PostUpdateState};
use crate::config::{AppConfig, ConfigStore, FileConfigStore, MemoryConfigStore, OrchestratorConfig};
use crate::document::{DocumentStore, WordPressStore};
use crate::error::{PipelineError, PipelineResult};
use crate::extract::{AiFallbackExtractor, ExtractorRegistry};
use crate::fetch::{HtmlFetcher, HttpFetcher};
use crate::fingerprint::{FileFingerprintStore, FingerprintStore, MemoryFingerprintStore};
use crate::model::TargetSelector;
use crate::pipeline::{ManualAddOutcome, ManualLink, Pipeline, PostTracker};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!("linkpost_pipelines_running", "Post pipelines currently past the admission gate.");
    });
}

/// Externally visible view of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub request_id: String,
    pub overall_status: PostStatus,
    pub target: TargetSelector,
    pub posts: BTreeMap<String, PostUpdateState>,
    pub created_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

impl From<BatchRecord> for BatchStatus {
    fn from(rec: BatchRecord) -> Self {
        Self {
            overall_status: rec.overall_status(),
            request_id: rec.request_id,
            target: rec.target,
            posts: rec.posts,
            created_at: rec.created_at,
            completed_at: rec.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStarted {
    pub request_id: String,
    /// Final state; only present for synchronous starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
}

#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    batches: Arc<dyn BatchStore>,
    gate: Arc<Semaphore>,
    settings: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, batches: Arc<dyn BatchStore>, settings: OrchestratorConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            batches,
            gate: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            settings,
        }
    }

    /// Wire the production collaborators from the service config.
    /// `config_path` is re-read for post configs on every lookup when given.
    pub fn from_app_config(cfg: &AppConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let timeout = StdDuration::from_secs(cfg.orchestrator.io_timeout_secs);
        let configs: Arc<dyn ConfigStore> = match config_path {
            Some(p) => Arc::new(FileConfigStore::new(p)),
            None => Arc::new(MemoryConfigStore::new(cfg.posts.clone())),
        };
        let fetcher: Arc<dyn HtmlFetcher> = Arc::new(HttpFetcher::new(&cfg.fetch, timeout)?);
        let documents: Arc<dyn DocumentStore> = Arc::new(WordPressStore::new(cfg.sites.clone(), timeout)?);
        let registry = Arc::new(ExtractorRegistry::standard(
            &cfg.extractors,
            AiFallbackExtractor::from_config(&cfg.ai),
        ));
        let (fingerprints, batches): (Arc<dyn FingerprintStore>, Arc<dyn BatchStore>) = if cfg.storage.in_memory {
            (Arc::new(MemoryFingerprintStore::new()), Arc::new(MemoryBatchStore::new()))
        } else {
            (
                Arc::new(FileFingerprintStore::new(&cfg.storage.dir)),
                Arc::new(FileBatchStore::new(&cfg.storage.dir)),
            )
        };
        info!(
            extractors = ?registry.names(),
            storage = %cfg.storage.dir.display(),
            in_memory = cfg.storage.in_memory,
            max_concurrent = cfg.orchestrator.max_concurrent,
            "orchestrator wired"
        );
        let pipeline = Pipeline::new(configs, fetcher, registry, fingerprints, documents)
            .with_home_site(cfg.service.home_site.clone())
            .with_io_timeout(cfg.orchestrator.io_timeout_secs);
        Ok(Self::new(pipeline, batches, cfg.orchestrator.clone()))
    }

    fn stale_after(&self) -> Duration {
        Duration::seconds(self.settings.stale_after_secs as i64)
    }

    /// Start a batch. With `sync` the call returns once every post is
    /// terminal; otherwise it returns as soon as the record exists.
    pub async fn start_batch(
        &self,
        post_ids: Vec<String>,
        target: TargetSelector,
        sync: bool,
    ) -> PipelineResult<BatchStarted> {
        ensure_metrics_described();
        let post_ids: Vec<String> = post_ids
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if post_ids.is_empty() {
            return Err(PipelineError::ValidationError("post_ids must not be empty".into()));
        }

        let cutoff = Utc::now() - Duration::seconds(self.settings.batch_retention_secs as i64);
        match self.batches.purge(cutoff, self.stale_after()).await {
            Ok(0) => {}
            Ok(n) => info!(purged = n, "expired batch records removed"),
            Err(e) => warn!(error = ?e, "batch gc failed"),
        }

        let record = BatchRecord::new(&post_ids, target, self.settings.log_capacity);
        self.batches.put(&record).await?;
        let request_id = record.request_id.clone();
        info!(request_id = %request_id, posts = record.post_ids.len(), target = %record.target, sync, "batch started");

        // Posts run on a detached task; dropping this future never cancels them.
        let this = self.clone();
        let handle = tokio::spawn(async move { this.drive(record).await });
        if sync {
            handle
                .await
                .map_err(|e| PipelineError::Internal(anyhow::anyhow!("batch task failed: {e}")))?;
            let status = self.get_batch_status(&request_id).await?;
            Ok(BatchStarted {
                request_id,
                status: Some(status),
            })
        } else {
            Ok(BatchStarted {
                request_id,
                status: None,
            })
        }
    }

    /// Run every post of `record` through the gate and wait for all of them.
    async fn drive(&self, record: BatchRecord) {
        let mut set = JoinSet::new();
        let mut by_task = HashMap::new();
        for post_id in &record.post_ids {
            let Some(state) = record.posts.get(post_id).cloned() else {
                continue;
            };
            let this = self.clone();
            let request_id = record.request_id.clone();
            let target = record.target.clone();
            let pid = post_id.clone();
            let handle = set.spawn(async move {
                let Ok(_permit) = this.gate.clone().acquire_owned().await else {
                    return;
                };
                gauge!("linkpost_pipelines_running").increment(1.0);
                let mut tracker = PostTracker::new(this.batches.clone(), request_id, state);
                this.pipeline.run_post(&pid, &target, &mut tracker).await;
                gauge!("linkpost_pipelines_running").decrement(1.0);
            });
            by_task.insert(handle.id(), post_id.clone());
        }
        while let Some(res) = set.join_next_with_id().await {
            if let Err(e) = res {
                let Some(post_id) = by_task.get(&e.id()) else {
                    continue;
                };
                warn!(request_id = %record.request_id, post_id = %post_id, error = %e, "post task aborted");
                gauge!("linkpost_pipelines_running").decrement(1.0);
                self.mark_failed(&record, post_id, &format!("pipeline task aborted: {e}")).await;
            }
        }
        info!(request_id = %record.request_id, "batch finished");
    }

    async fn mark_failed(&self, record: &BatchRecord, post_id: &str, message: &str) {
        let current = match self.batches.get(&record.request_id).await {
            Ok(Some(rec)) => rec.posts.get(post_id).cloned(),
            _ => None,
        };
        let Some(mut state) = current.or_else(|| record.posts.get(post_id).cloned()) else {
            return;
        };
        state.log(message);
        state.set_status(PostStatus::Running, "running");
        state.set_status(PostStatus::Failed, message);
        if let Err(e) = self.batches.upsert_post(&record.request_id, &state).await {
            warn!(request_id = %record.request_id, post_id, error = ?e, "could not record failure");
        }
    }

    pub async fn get_batch_status(&self, request_id: &str) -> PipelineResult<BatchStatus> {
        let mut rec = self.load_batch(request_id).await?;
        let expired = rec.expire_stale(Utc::now(), self.stale_after());
        if expired.is_empty() {
            return Ok(rec.into());
        }
        // Persist the failure so the stalled pipeline cannot flip it back later.
        for state in &expired {
            warn!(request_id, post_id = %state.post_id, "stalled post marked failed");
            self.batches.upsert_post(request_id, state).await?;
        }
        let rec = self.load_batch(request_id).await?;
        Ok(rec.view(Utc::now(), self.stale_after()).into())
    }

    async fn load_batch(&self, request_id: &str) -> PipelineResult<BatchRecord> {
        self.batches
            .get(request_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {request_id}")))
    }

    /// The last `tail` log lines of one post (all of them when `None`).
    pub async fn get_post_logs(
        &self,
        request_id: &str,
        post_id: &str,
        tail: Option<usize>,
    ) -> PipelineResult<Vec<String>> {
        let status = self.get_batch_status(request_id).await?;
        let state = status
            .posts
            .get(post_id)
            .ok_or_else(|| PipelineError::NotFound(format!("post {post_id} in batch {request_id}")))?;
        Ok(state.tail(tail.unwrap_or(state.logs.len())))
    }

    pub async fn add_manual_links(
        &self,
        post_id: &str,
        links: &[ManualLink],
        date: Option<NaiveDate>,
        target: &TargetSelector,
    ) -> PipelineResult<ManualAddOutcome> {
        self.pipeline.add_manual_links(post_id, links, date, target).await
    }
}
