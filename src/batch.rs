//! # Batch state
//! Per-request records with one `PostUpdateState` per post.
//!
//! Records live in a `BatchStore` keyed by request id and are only ever
//! changed through per-post upserts, which refuse to move a post out of a
//! terminal state. A queued/running post that has not been touched for longer
//! than the staleness TTL reads as failed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::fingerprint::{safe_component, write_json_atomic};
use crate::model::TargetSelector;

pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Queued,
    Running,
    Success,
    NoChanges,
    Partial,
    Failed,
}

impl PostStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::NoChanges | Self::Partial | Self::Failed)
    }

    /// queued -> running -> terminal; nothing leaves a terminal state.
    pub fn can_become(self, next: PostStatus) -> bool {
        match self {
            Self::Queued => true,
            Self::Running => next != Self::Queued,
            _ => self == next,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    NoChanges,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub status: TargetStatus,
    pub native_id: String,
    pub links_added: usize,
    pub sections_pruned: usize,
    #[serde(default)]
    pub message: String,
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostUpdateState {
    pub post_id: String,
    pub status: PostStatus,
    pub progress: u8,
    pub message: String,
    pub logs: VecDeque<String>,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    pub links_found: usize,
    pub links_added: usize,
    /// site key -> outcome of the mutation on that site
    #[serde(default)]
    pub targets: BTreeMap<String, TargetState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PostUpdateState {
    pub fn new(post_id: impl Into<String>, log_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            post_id: post_id.into(),
            status: PostStatus::Queued,
            progress: 0,
            message: "queued".to_string(),
            logs: VecDeque::new(),
            log_capacity: log_capacity.max(1),
            links_found: 0,
            links_added: 0,
            targets: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a timestamped line; the oldest line goes once the buffer is full.
    pub fn log(&mut self, line: impl AsRef<str>) {
        let now = Utc::now();
        self.logs
            .push_back(format!("[{}] {}", now.format("%Y-%m-%dT%H:%M:%SZ"), line.as_ref()));
        while self.logs.len() > self.log_capacity {
            self.logs.pop_front();
        }
        self.updated_at = now;
    }

    /// Progress never goes backwards; values above 100 clamp.
    pub fn advance(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        self.updated_at = Utc::now();
    }

    /// Returns false (and changes nothing) for a disallowed transition.
    pub fn set_status(&mut self, next: PostStatus, message: impl Into<String>) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        self.message = message.into();
        if next.is_terminal() {
            self.progress = 100;
        }
        self.updated_at = Utc::now();
        true
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        let start = self.logs.len().saturating_sub(n);
        self.logs.iter().skip(start).cloned().collect()
    }

    /// Only running posts age out; queued ones may legitimately wait at the gate.
    fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.status == PostStatus::Running && now - self.updated_at > ttl
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub request_id: String,
    pub post_ids: Vec<String>,
    pub target: TargetSelector,
    pub posts: BTreeMap<String, PostUpdateState>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchRecord {
    /// A fresh record with every post queued. Duplicate post ids collapse.
    pub fn new(post_ids: &[String], target: TargetSelector, log_capacity: usize) -> Self {
        let mut ids: Vec<String> = Vec::with_capacity(post_ids.len());
        for id in post_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        let posts = ids
            .iter()
            .map(|id| (id.clone(), PostUpdateState::new(id.clone(), log_capacity)))
            .collect();
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            post_ids: ids,
            target,
            posts,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn overall_status(&self) -> PostStatus {
        let states: Vec<PostStatus> = self.posts.values().map(|p| p.status).collect();
        if states.is_empty() {
            return PostStatus::NoChanges;
        }
        if states.iter().all(|s| *s == PostStatus::Queued) {
            return PostStatus::Queued;
        }
        if states.iter().any(|s| !s.is_terminal()) {
            return PostStatus::Running;
        }
        if states.iter().all(|s| *s == PostStatus::NoChanges) {
            PostStatus::NoChanges
        } else if states
            .iter()
            .all(|s| matches!(s, PostStatus::Success | PostStatus::NoChanges))
        {
            PostStatus::Success
        } else if states.iter().all(|s| *s == PostStatus::Failed) {
            PostStatus::Failed
        } else {
            PostStatus::Partial
        }
    }

    pub fn is_complete(&self) -> bool {
        self.posts.values().all(|p| p.status.is_terminal())
    }

    /// Merge one post's state. Terminal states are never overwritten and
    /// progress never decreases. Returns whether anything was applied.
    pub fn apply(&mut self, incoming: &PostUpdateState) -> bool {
        let Some(current) = self.posts.get_mut(&incoming.post_id) else {
            return false;
        };
        if current.status.is_terminal() || !current.status.can_become(incoming.status) {
            return false;
        }
        let progress = current.progress.max(incoming.progress);
        *current = incoming.clone();
        current.progress = progress;
        if self.completed_at.is_none() && self.is_complete() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Fail every running post that made no progress within `stale_after`.
    /// Returns the expired states so the caller can persist them.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, stale_after: Duration) -> Vec<PostUpdateState> {
        let mut expired = Vec::new();
        let mut latest = self.created_at;
        for p in self.posts.values_mut() {
            if p.is_stale(now, stale_after) {
                let msg = format!(
                    "no progress for over {}s; treated as failed",
                    stale_after.num_seconds()
                );
                p.log(&msg);
                p.set_status(PostStatus::Failed, msg);
                p.updated_at = now;
                expired.push(p.clone());
            }
            latest = latest.max(p.updated_at);
        }
        if self.completed_at.is_none() && self.is_complete() {
            self.completed_at = Some(latest);
        }
        expired
    }

    /// The record as readers see it: stale running posts read as failed.
    pub fn view(&self, now: DateTime<Utc>, stale_after: Duration) -> BatchRecord {
        let mut out = self.clone();
        out.expire_stale(now, stale_after);
        out
    }
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn put(&self, record: &BatchRecord) -> Result<()>;
    async fn get(&self, request_id: &str) -> Result<Option<BatchRecord>>;
    /// Atomic read-merge-write of one post's state (see `BatchRecord::apply`).
    async fn upsert_post(&self, request_id: &str, state: &PostUpdateState) -> Result<bool>;
    /// Drop completed records that finished before `cutoff`.
    async fn purge(&self, cutoff: DateTime<Utc>, stale_after: Duration) -> Result<usize>;
}

fn expired(rec: &BatchRecord, cutoff: DateTime<Utc>, stale_after: Duration) -> bool {
    rec.view(Utc::now(), stale_after)
        .completed_at
        .is_some_and(|t| t < cutoff)
}

#[derive(Default)]
pub struct MemoryBatchStore {
    records: RwLock<HashMap<String, BatchRecord>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn put(&self, record: &BatchRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<BatchRecord>> {
        Ok(self.records.read().await.get(request_id).cloned())
    }

    async fn upsert_post(&self, request_id: &str, state: &PostUpdateState) -> Result<bool> {
        let mut guard = self.records.write().await;
        Ok(guard
            .get_mut(request_id)
            .is_some_and(|rec| rec.apply(state)))
    }

    async fn purge(&self, cutoff: DateTime<Utc>, stale_after: Duration) -> Result<usize> {
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|_, rec| !expired(rec, cutoff, stale_after));
        Ok(before - guard.len())
    }
}

/// One JSON document per request under `<dir>/batches/`.
pub struct FileBatchStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileBatchStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            root: dir.as_ref().join("batches"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, request_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", safe_component(request_id)))
    }

    async fn lock_for(&self, request_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(request_id.to_string())
            .or_default()
            .clone()
    }

    async fn read(path: &Path) -> Result<Option<BatchRecord>> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Ok(Some(
                serde_json::from_str(&s).with_context(|| format!("parsing {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[async_trait]
impl BatchStore for FileBatchStore {
    async fn put(&self, record: &BatchRecord) -> Result<()> {
        let lock = self.lock_for(&record.request_id).await;
        let _guard = lock.lock().await;
        write_json_atomic(&self.path_for(&record.request_id), record).await
    }

    async fn get(&self, request_id: &str) -> Result<Option<BatchRecord>> {
        Self::read(&self.path_for(request_id)).await
    }

    async fn upsert_post(&self, request_id: &str, state: &PostUpdateState) -> Result<bool> {
        let lock = self.lock_for(request_id).await;
        let _guard = lock.lock().await;
        let path = self.path_for(request_id);
        let Some(mut rec) = Self::read(&path).await? else {
            return Ok(false);
        };
        if !rec.apply(state) {
            return Ok(false);
        }
        write_json_atomic(&path, &rec).await?;
        Ok(true)
    }

    async fn purge(&self, cutoff: DateTime<Utc>, stale_after: Duration) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("listing {}", self.root.display())),
        };
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let rec = match Self::read(&path).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable batch record");
                    continue;
                }
            };
            if expired(&rec, cutoff, stale_after) {
                let lock = self.lock_for(&rec.request_id).await;
                let _guard = lock.lock().await;
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("removing {}", path.display()))?;
                removed += 1;
            }
        }
        self.locks.lock().await.retain(|_, l| Arc::strong_count(l) > 1);
        Ok(removed)
    }
}
