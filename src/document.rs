//! Target document bodies on external sites.
//!
//! Bodies are raw block markup. A write either fully replaces the body or
//! fails; there is no partial write.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SiteConfig;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read_body(&self, site: &str, native_id: &str) -> Result<String>;
    async fn write_body(&self, site: &str, native_id: &str, body: &str) -> Result<()>;
}

/// WordPress REST (`/wp-json/wp/v2/posts/{id}`) with application-password
/// basic auth, one entry per configured site key.
pub struct WordPressStore {
    http: reqwest::Client,
    sites: BTreeMap<String, SiteConfig>,
}

#[derive(Deserialize)]
struct WpPost {
    content: WpContent,
}

#[derive(Deserialize)]
struct WpContent {
    /// Only present with `context=edit`.
    raw: Option<String>,
}

impl WordPressStore {
    pub fn new(sites: BTreeMap<String, SiteConfig>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { http, sites })
    }

    fn endpoint(&self, site: &str, native_id: &str) -> Result<(String, &SiteConfig)> {
        let cfg = self
            .sites
            .get(site)
            .ok_or_else(|| anyhow!("site '{site}' is not configured"))?;
        if native_id.is_empty() || !native_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("invalid post id '{native_id}' for site '{site}'"));
        }
        let base = cfg.base_url.trim_end_matches('/');
        Ok((format!("{base}/wp-json/wp/v2/posts/{native_id}"), cfg))
    }

    fn authed(&self, req: reqwest::RequestBuilder, site: &str, cfg: &SiteConfig) -> reqwest::RequestBuilder {
        if cfg.username.is_empty() {
            req
        } else {
            req.basic_auth(&cfg.username, Some(cfg.resolved_password(site)))
        }
    }
}

#[async_trait]
impl DocumentStore for WordPressStore {
    async fn read_body(&self, site: &str, native_id: &str) -> Result<String> {
        let (url, cfg) = self.endpoint(site, native_id)?;
        let req = self.http.get(&url).query(&[("context", "edit")]);
        let post: WpPost = self
            .authed(req, site, cfg)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url} non-2xx"))?
            .json()
            .await
            .context("decoding post json")?;
        post.content
            .raw
            .ok_or_else(|| anyhow!("site '{site}' returned no raw content (missing edit rights?)"))
    }

    async fn write_body(&self, site: &str, native_id: &str, body: &str) -> Result<()> {
        let (url, cfg) = self.endpoint(site, native_id)?;
        let req = self.http.post(&url).json(&json!({ "content": body }));
        self.authed(req, site, cfg)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url} non-2xx"))?;
        Ok(())
    }
}

/// In-process bodies keyed by (site, id). Sites can be marked as failing
/// writes to exercise partial outcomes.
#[derive(Default)]
pub struct MemoryDocumentStore {
    bodies: Mutex<HashMap<(String, String), String>>,
    failing: Mutex<HashSet<String>>,
    writes: Mutex<usize>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(self, site: &str, native_id: &str, body: impl Into<String>) -> Self {
        self.set_body(site, native_id, body);
        self
    }

    pub fn set_body(&self, site: &str, native_id: &str, body: impl Into<String>) {
        self.bodies
            .lock()
            .expect("document mutex poisoned")
            .insert((site.to_string(), native_id.to_string()), body.into());
    }

    pub fn body(&self, site: &str, native_id: &str) -> Option<String> {
        self.bodies
            .lock()
            .expect("document mutex poisoned")
            .get(&(site.to_string(), native_id.to_string()))
            .cloned()
    }

    pub fn fail_writes_for(&self, site: &str) {
        self.failing
            .lock()
            .expect("document mutex poisoned")
            .insert(site.to_string());
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().expect("document mutex poisoned")
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read_body(&self, site: &str, native_id: &str) -> Result<String> {
        self.body(site, native_id)
            .ok_or_else(|| anyhow!("no document {native_id} on site '{site}'"))
    }

    async fn write_body(&self, site: &str, native_id: &str, body: &str) -> Result<()> {
        if self.failing.lock().expect("document mutex poisoned").contains(site) {
            return Err(anyhow!("site '{site}' rejected the write"));
        }
        self.set_body(site, native_id, body);
        *self.writes.lock().expect("document mutex poisoned") += 1;
        Ok(())
    }
}
