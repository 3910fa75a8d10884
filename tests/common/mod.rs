// tests/common/mod.rs
// Shared in-process wiring: memory stores, canned pages, a mock AI client.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use linkpost_sync::batch::{BatchStore, MemoryBatchStore};
use linkpost_sync::config::{ExtractorsConfig, MemoryConfigStore, OrchestratorConfig};
use linkpost_sync::document::MemoryDocumentStore;
use linkpost_sync::extract::ai::{AiExtraction, MockClient};
use linkpost_sync::extract::{AiFallbackExtractor, ExtractorRegistry};
use linkpost_sync::fetch::{HtmlFetcher, StaticFetcher};
use linkpost_sync::fingerprint::MemoryFingerprintStore;
use linkpost_sync::model::SourceConfig;
use linkpost_sync::pipeline::Pipeline;
use linkpost_sync::Orchestrator;

pub const SOURCE: &str = "https://src.test/today";
pub const EMPTY_BODY: &str = "<!-- wp:paragraph -->\n<p>Daily links.</p>\n<!-- /wp:paragraph -->";

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// A page with today's heading followed by the given (title, url) links.
pub fn heading_page(links: &[(&str, &str)]) -> String {
    let items: String = links
        .iter()
        .map(|(t, u)| format!(r#"<li><a href="{u}">{t}</a></li>"#))
        .collect();
    format!(
        "<html><body><h2>Older</h2><p>nothing</p><h2>{}</h2><ul>{items}</ul><h2>Archive</h2>\
<ul><li><a href=\"https://src.test/archive\">Archive</a></li></ul></body></html>",
        today().format("%B %-d, %Y")
    )
}

/// One post, one source, one site ("main" -> document "100").
pub fn post_config(identity: &str, sources: &[&str]) -> SourceConfig {
    let mut cfg = SourceConfig::new(identity, sources.iter().map(|s| s.to_string()).collect());
    cfg.site_targets.insert("main".into(), "100".into());
    cfg
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub configs: Arc<MemoryConfigStore>,
    pub documents: Arc<MemoryDocumentStore>,
    pub fingerprints: Arc<MemoryFingerprintStore>,
    pub batches: Arc<MemoryBatchStore>,
    pub ai: Arc<MockClient>,
}

pub struct HarnessBuilder {
    posts: BTreeMap<String, SourceConfig>,
    fetcher: Arc<dyn HtmlFetcher>,
    documents: MemoryDocumentStore,
    settings: OrchestratorConfig,
    ai: AiExtraction,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            posts: BTreeMap::new(),
            fetcher: Arc::new(StaticFetcher::new()),
            documents: MemoryDocumentStore::new(),
            settings: OrchestratorConfig::default(),
            ai: AiExtraction {
                links: Vec::new(),
                confidence: 0.0,
            },
        }
    }

    pub fn post(mut self, id: &str, cfg: SourceConfig) -> Self {
        self.posts.insert(id.to_string(), cfg);
        self
    }

    pub fn fetcher(mut self, f: Arc<dyn HtmlFetcher>) -> Self {
        self.fetcher = f;
        self
    }

    pub fn pages(self, pages: &[(&str, String)]) -> Self {
        let mut f = StaticFetcher::new();
        for (u, html) in pages {
            f = f.with_page(*u, html.clone());
        }
        self.fetcher(Arc::new(f))
    }

    pub fn document(mut self, site: &str, id: &str, body: &str) -> Self {
        self.documents = self.documents.with_body(site, id, body);
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.settings.max_concurrent = n;
        self
    }

    pub fn ai_reply(mut self, reply: AiExtraction) -> Self {
        self.ai = reply;
        self
    }

    pub fn build(self) -> Harness {
        let configs = Arc::new(MemoryConfigStore::new(self.posts));
        let documents = Arc::new(self.documents);
        let fingerprints = Arc::new(MemoryFingerprintStore::new());
        let batches = Arc::new(MemoryBatchStore::new());
        let ai = Arc::new(MockClient::new(self.ai));
        let registry = Arc::new(ExtractorRegistry::standard(
            &ExtractorsConfig::default(),
            AiFallbackExtractor::new(ai.clone(), 0.5, 60_000),
        ));
        let pipeline = Pipeline::new(
            configs.clone(),
            self.fetcher,
            registry,
            fingerprints.clone(),
            documents.clone(),
        )
        .with_home_site(Some("main".into()))
        .with_io_timeout(5);
        let batch_store: Arc<dyn BatchStore> = batches.clone();
        let orchestrator = Orchestrator::new(pipeline, batch_store, self.settings);
        Harness {
            orchestrator,
            configs,
            documents,
            fingerprints,
            batches,
            ai,
        }
    }
}
