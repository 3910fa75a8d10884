//! AI-backed extraction: provider abstraction + file cache + daily limit, and
//! the confidence-gated fallback extractor built on top of it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use metrics::{counter, describe_counter};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::heading_date::links_under_date_heading;
use super::{ExtractInput, Extractor};
use crate::config::AiConfig;
use crate::fingerprint::write_json_atomic;
use crate::model::ExtractedLink;

pub const NAME: &str = "ai";

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

/// One link as reported by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiLink {
    #[serde(default)]
    pub title: String,
    pub url: String,
    /// `YYYY-MM-DD`; missing means "the requested date".
    #[serde(default)]
    pub published_date: Option<String>,
}

/// Structured answer: candidates plus a whole-result confidence in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiExtraction {
    #[serde(default)]
    pub links: Vec<AiLink>,
    #[serde(default)]
    pub confidence: f32,
}

/// Trait object used by the fallback extractor and tests.
pub trait AiClient: Send + Sync {
    /// `None` signals an internal failure (disabled, transport, limit, bad reply).
    fn extract<'a>(
        &'a self,
        html: &'a str,
        date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Option<AiExtraction>> + Send + 'a>>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynAiClient = Arc<dyn AiClient>;

/// Pick the client for `[ai]`: `AI_TEST_MODE=mock` or provider `mock` gives a
/// mock that never finds links, a disabled section gives `DisabledClient`,
/// and `openai` gets the cached, rate-limited real provider.
pub fn build_client_from_config(config: &AiConfig) -> DynAiClient {
    let mock_env = std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false);
    if mock_env || config.provider == "mock" {
        return Arc::new(MockClient::new(AiExtraction {
            links: Vec::new(),
            confidence: 0.0,
        }));
    }

    if !config.enabled {
        return Arc::new(DisabledClient);
    }

    match config.provider.as_str() {
        "openai" => match OpenAiProvider::new(&config.model, config.resolved_api_key()) {
            Ok(provider) => Arc::new(CachingClient::new(
                provider,
                config.cache_dir.clone(),
                config.daily_limit,
            )),
            Err(e) => {
                tracing::warn!(error = ?e, "openai client init failed; AI disabled");
                Arc::new(DisabledClient)
            }
        },
        _ => Arc::new(DisabledClient),
    }
}

// ------------------------------------------------------------
// Remote providers
// ------------------------------------------------------------

/// Low-level provider: does a *real* remote call. Separated so the same
/// caching wrapper serves production and tests.
pub trait Provider: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        html: &'a str,
        date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Option<AiExtraction>> + Send + 'a>>;
    fn name(&self) -> &'static str;
}

const SYSTEM_PROMPT: &str = "You extract links from a web page. Return JSON only: \
{\"links\":[{\"title\":string,\"url\":string,\"published_date\":\"YYYY-MM-DD\"}],\"confidence\":number}. \
Include only links the page presents as posted on the requested date. \
confidence is 0..1: how sure you are the page has a dated list and you found it.";

/// OpenAI provider (Chat Completions API, JSON mode).
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(model: &str, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("linkpost-sync/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_key,
            model: model.to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        })
    }

    /// Point at a different endpoint (tests, proxies).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl Provider for OpenAiProvider {
    fn fetch<'a>(
        &'a self,
        html: &'a str,
        date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Option<AiExtraction>> + Send + 'a>> {
        Box::pin(async move {
            if self.api_key.is_empty() {
                return None;
            }

            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct Format {
                #[serde(rename = "type")]
                kind: &'static str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                messages: Vec<Msg<'a>>,
                temperature: f32,
                response_format: Format,
            }
            #[derive(Deserialize)]
            struct Resp {
                choices: Vec<Choice>,
            }
            #[derive(Deserialize)]
            struct Choice {
                message: ChoiceMsg,
            }
            #[derive(Deserialize)]
            struct ChoiceMsg {
                content: String,
            }

            let user = format!(
                "Requested date: {}\n\nPage markup:\n{}",
                date.format("%Y-%m-%d"),
                html
            );
            let req = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: SYSTEM_PROMPT,
                    },
                    Msg {
                        role: "user",
                        content: &user,
                    },
                ],
                temperature: 0.0,
                response_format: Format {
                    kind: "json_object",
                },
            };

            let resp = match self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = ?e, "openai request failed");
                    return None;
                }
            };
            if !resp.status().is_success() {
                tracing::warn!(status = %resp.status(), "openai non-2xx");
                return None;
            }
            let body: Resp = resp.json().await.ok()?;
            let content = body.choices.first().map(|c| c.message.content.as_str())?;
            serde_json::from_str::<AiExtraction>(content).ok()
        })
    }
    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Never answers; the heading scan takes over.
pub struct DisabledClient;

impl AiClient for DisabledClient {
    fn extract<'a>(
        &'a self,
        _html: &'a str,
        _date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Option<AiExtraction>> + Send + 'a>> {
        Box::pin(async { None })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Fixed answer for tests/local runs; counts calls.
pub struct MockClient {
    fixed: AiExtraction,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockClient {
    pub fn new(fixed: AiExtraction) -> Self {
        Self {
            fixed,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl AiClient for MockClient {
    fn extract<'a>(
        &'a self,
        _html: &'a str,
        _date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Option<AiExtraction>> + Send + 'a>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let out = self.fixed.clone();
        Box::pin(async move { Some(out) })
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Response cache and daily call budget
// ------------------------------------------------------------

/// The day's call count is loaded lazily and kept behind an async lock;
/// cache files and the counter are written atomically.
pub struct CachingClient<P: Provider> {
    inner: P,
    cache_dir: PathBuf,
    daily_limit_max: u32,
    counter: Mutex<Option<DailyCounter>>,
}

impl<P: Provider> CachingClient<P> {
    pub fn new(inner: P, cache_dir: PathBuf, daily_limit_max: u32) -> Self {
        Self {
            inner,
            cache_dir,
            daily_limit_max,
            counter: Mutex::new(None),
        }
    }

    async fn extract_impl(&self, html: &str, date: NaiveDate) -> Option<AiExtraction> {
        // 1) Cache lookup (hits do not count against the limit).
        let key = cache_key(html, date);
        if let Some(hit) = read_cache_file(&self.cache_dir, &key).await {
            return Some(hit);
        }

        // 2) Daily limit.
        {
            let mut g = self.counter.lock().await;
            if g.is_none() {
                *g = Some(load_daily_counter(&self.cache_dir).await.unwrap_or_default());
            }
            let dc = g.get_or_insert_with(DailyCounter::default);
            if dc.is_expired() {
                dc.reset_to_today();
                save_daily_counter(&self.cache_dir, dc).await;
            }
            if dc.count >= self.daily_limit_max {
                tracing::warn!(limit = self.daily_limit_max, "AI daily limit reached");
                return None;
            }
        }

        // 3) Real call.
        let fresh = self.inner.fetch(html, date).await?;
        if let Err(e) = write_json_atomic(&cache_path(&self.cache_dir, &key), &fresh).await {
            tracing::debug!(error = %e, "AI cache write failed");
        }
        let mut g = self.counter.lock().await;
        let dc = g.get_or_insert_with(DailyCounter::default);
        dc.count = dc.count.saturating_add(1);
        save_daily_counter(&self.cache_dir, dc).await;
        Some(fresh)
    }
}

impl<P: Provider> AiClient for CachingClient<P> {
    fn extract<'a>(
        &'a self,
        html: &'a str,
        date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Option<AiExtraction>> + Send + 'a>> {
        Box::pin(self.extract_impl(html, date))
    }
    fn provider_name(&self) -> &'static str {
        self.inner.name()
    }
}

fn cache_key(html: &str, date: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(html.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

async fn read_cache_file(dir: &Path, key: &str) -> Option<AiExtraction> {
    let buf = tokio::fs::read(cache_path(dir, key)).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}
impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
        }
    }
}
impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }
    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn counter_path(dir: &Path) -> PathBuf {
    dir.join("daily_count.json")
}

async fn load_daily_counter(dir: &Path) -> Option<DailyCounter> {
    let buf = tokio::fs::read(counter_path(dir)).await.ok()?;
    serde_json::from_slice(&buf).ok()
}

async fn save_daily_counter(dir: &Path, dc: &DailyCounter) {
    if let Err(e) = write_json_atomic(&counter_path(dir), dc).await {
        tracing::debug!(error = %e, "AI daily counter write failed");
    }
}

// ------------------------------------------------------------
// Confidence-gated fallback extractor
// ------------------------------------------------------------

/// What the AI stage produced for one page.
#[derive(Debug, Clone, PartialEq)]
pub enum AiOutcome {
    Accepted(Vec<ExtractedLink>),
    /// The whole result is dropped; never filtered per item.
    LowConfidenceDiscard { confidence: f32 },
    /// Client failure (disabled, transport, limit, unparsable).
    Unavailable,
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "linkpost_ai_discards_total",
            "AI results discarded for low confidence."
        );
        describe_counter!(
            "linkpost_ai_unavailable_total",
            "AI calls that produced no usable result."
        );
    });
}

/// Last resort: ask the model, and if its answer is missing or not
/// confident enough, fall back to the heading scan.
pub struct AiFallbackExtractor {
    client: DynAiClient,
    threshold: f32,
    max_html_chars: usize,
}

impl AiFallbackExtractor {
    pub fn new(client: DynAiClient, threshold: f32, max_html_chars: usize) -> Self {
        Self {
            client,
            threshold: threshold.clamp(0.0, 1.0),
            max_html_chars,
        }
    }

    pub fn from_config(cfg: &AiConfig) -> Self {
        Self::new(
            build_client_from_config(cfg),
            cfg.confidence_threshold,
            cfg.max_html_chars,
        )
    }

    pub async fn ask(&self, html: &str, date: NaiveDate) -> AiOutcome {
        let trimmed = truncate_markup(html, self.max_html_chars);
        let Some(res) = self.client.extract(&trimmed, date).await else {
            return AiOutcome::Unavailable;
        };
        if !res.confidence.is_finite() || res.confidence < self.threshold {
            return AiOutcome::LowConfidenceDiscard {
                confidence: res.confidence,
            };
        }
        let links = res
            .links
            .into_iter()
            .filter_map(|l| {
                let day = match l.published_date.as_deref().map(str::trim) {
                    None | Some("") => date,
                    Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?,
                };
                (day == date).then(|| ExtractedLink::new(l.title, l.url, day))
            })
            .collect();
        AiOutcome::Accepted(links)
    }
}

#[async_trait]
impl Extractor for AiFallbackExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    async fn extract(&self, input: &ExtractInput<'_>) -> Result<Vec<ExtractedLink>> {
        ensure_metrics_described();
        match self.ask(input.html, input.date).await {
            AiOutcome::Accepted(links) => {
                tracing::info!(
                    url = input.source_url,
                    provider = self.client.provider_name(),
                    links = links.len(),
                    "AI extraction accepted"
                );
                Ok(links)
            }
            AiOutcome::LowConfidenceDiscard { confidence } => {
                counter!("linkpost_ai_discards_total").increment(1);
                tracing::info!(
                    url = input.source_url,
                    confidence,
                    threshold = self.threshold,
                    "AI result discarded, scanning headings"
                );
                Ok(links_under_date_heading(input.html, input.date))
            }
            AiOutcome::Unavailable => {
                counter!("linkpost_ai_unavailable_total").increment(1);
                tracing::debug!(url = input.source_url, "AI unavailable, scanning headings");
                Ok(links_under_date_heading(input.html, input.date))
            }
        }
    }
}

/// Drop scripts, styles and comments, then cap the length on a char boundary.
pub fn truncate_markup(html: &str, max_chars: usize) -> String {
    static RE_NOISE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<!--.*?-->|<svg\b.*?</svg>")
            .expect("noise regex")
    });
    let stripped = RE_NOISE.replace_all(html, "");
    stripped.chars().take(max_chars).collect()
}
