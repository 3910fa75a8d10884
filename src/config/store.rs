// src/config/store.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::model::SourceConfig;

/// Read-only access to per-post source configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` for an unknown post id.
    async fn get_config(&self, post_id: &str) -> Result<Option<SourceConfig>>;
}

/// Serves `[posts.*]` from the service config file, re-read on every lookup
/// so edits made by the admin tooling apply without a restart.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get_config(&self, post_id: &str) -> Result<Option<SourceConfig>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading post configs from {}", self.path.display()))?;
        let ext = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = super::parse_config(&content, &ext)?;
        Ok(cfg.posts.remove(post_id))
    }
}

#[derive(Default)]
pub struct MemoryConfigStore {
    posts: RwLock<BTreeMap<String, SourceConfig>>,
}

impl MemoryConfigStore {
    pub fn new(posts: BTreeMap<String, SourceConfig>) -> Self {
        Self {
            posts: RwLock::new(posts),
        }
    }

    pub async fn insert(&self, post_id: impl Into<String>, cfg: SourceConfig) {
        self.posts.write().await.insert(post_id.into(), cfg);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_config(&self, post_id: &str) -> Result<Option<SourceConfig>> {
        Ok(self.posts.read().await.get(post_id).cloned())
    }
}
