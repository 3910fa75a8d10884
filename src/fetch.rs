//! Raw page fetch. Retries are the fetcher's own business; the pipeline calls
//! `fetch_html` once per source URL per run.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::FetchConfig;

#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    http: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(cfg: &FetchConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(Duration::from_secs(5).min(timeout))
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            max_body_bytes: cfg.max_body_bytes,
        })
    }
}

#[async_trait]
impl HtmlFetcher for HttpFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid source url {url}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("only http/https source urls are allowed, got {}", parsed.scheme());
        }
        let resp = self
            .http
            .get(parsed)
            .send()
            .await
            .context("source http get()")?
            .error_for_status()
            .context("source non-2xx")?;
        if let Some(len) = resp.content_length() {
            if len as usize > self.max_body_bytes {
                return Err(anyhow!("source body too large ({len} bytes)"));
            }
        }
        let body = resp.text().await.context("source http .text()")?;
        if body.len() > self.max_body_bytes {
            return Err(anyhow!("source body too large ({} bytes)", body.len()));
        }
        Ok(body)
    }
}

/// Serves canned pages; unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct StaticFetcher {
    pages: Mutex<HashMap<String, String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.set_page(url, html);
        self
    }

    pub fn set_page(&self, url: impl Into<String>, html: impl Into<String>) {
        self.pages
            .lock()
            .expect("static fetcher mutex poisoned")
            .insert(url.into(), html.into());
    }
}

#[async_trait]
impl HtmlFetcher for StaticFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String> {
        self.pages
            .lock()
            .expect("static fetcher mutex poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("unreachable: {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_fetcher_returns_body_and_rejects_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/today"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h2>Today</h2>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let f = HttpFetcher::new(&FetchConfig::default(), Duration::from_secs(5)).unwrap();
        let body = f.fetch_html(&format!("{}/today", server.uri())).await.unwrap();
        assert_eq!(body, "<h2>Today</h2>");
        assert!(f.fetch_html(&format!("{}/gone", server.uri())).await.is_err());
        assert!(f.fetch_html("ftp://example.com/x").await.is_err());
    }

    #[tokio::test]
    async fn http_fetcher_enforces_body_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;
        let cfg = FetchConfig {
            max_body_bytes: 16,
            ..FetchConfig::default()
        };
        let f = HttpFetcher::new(&cfg, Duration::from_secs(5)).unwrap();
        assert!(f.fetch_html(&server.uri()).await.is_err());
    }
}
