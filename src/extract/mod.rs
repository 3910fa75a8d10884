//! # Extractor registry
//! Turns fetched source markup into candidate links for one target date.
//!
//! Selection order for a source URL: explicit per-URL assignment, then the
//! first registered plugin whose `can_handle` claims the URL, then the AI
//! fallback. Exactly one extractor runs per URL; results are never merged
//! across extractors. Extractor errors are logged and count as zero links.

pub mod ai;
pub mod dated_table;
pub mod feed;
pub mod heading_date;
pub mod time_tag;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use metrics::{counter, describe_counter, histogram};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::ExtractorsConfig;
use crate::model::ExtractedLink;

pub use ai::{AiClient, AiFallbackExtractor, AiOutcome, DynAiClient};
pub use dated_table::DatedTableExtractor;
pub use feed::FeedExtractor;
pub use heading_date::HeadingDateExtractor;
pub use time_tag::TimeTagExtractor;

/// Everything an extractor sees for one source page.
#[derive(Debug, Clone, Copy)]
pub struct ExtractInput<'a> {
    pub source_url: &'a str,
    pub html: &'a str,
    pub date: NaiveDate,
    /// The post's timezone; feeds carry instants that must be mapped to days.
    pub tz: Tz,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this extractor claims `url` in automatic selection.
    fn can_handle(&self, url: &str) -> bool;

    async fn extract(&self, input: &ExtractInput<'_>) -> Result<Vec<ExtractedLink>>;

    /// Preceding days whose fingerprints must also be consulted, for sources
    /// that keep showing links from earlier days.
    fn lookback_days(&self) -> u32 {
        0
    }
}

pub type DynExtractor = Arc<dyn Extractor>;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "linkpost_extract_links_total",
            "Links produced by extractors after normalization."
        );
        describe_counter!(
            "linkpost_extractor_errors_total",
            "Extractor failures contained as zero links."
        );
    });
}

pub struct ExtractorRegistry {
    /// Priority order for automatic selection.
    plugins: Vec<DynExtractor>,
    fallback: DynExtractor,
}

impl ExtractorRegistry {
    pub fn new(plugins: Vec<DynExtractor>, fallback: DynExtractor) -> Self {
        Self { plugins, fallback }
    }

    /// The built-in registration table.
    pub fn standard(cfg: &ExtractorsConfig, ai: AiFallbackExtractor) -> Self {
        let hosts = |name: &str| cfg.hosts.get(name).cloned().unwrap_or_default();
        Self::new(
            vec![
                Arc::new(FeedExtractor::new(hosts(feed::NAME))),
                Arc::new(TimeTagExtractor::new(hosts(time_tag::NAME))),
                Arc::new(DatedTableExtractor::new(hosts(dated_table::NAME))),
                Arc::new(HeadingDateExtractor::new(hosts(heading_date::NAME))),
            ],
            Arc::new(ai),
        )
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins
            .iter()
            .chain(std::iter::once(&self.fallback))
            .map(|e| e.name())
            .collect()
    }

    pub fn by_name(&self, name: &str) -> Option<DynExtractor> {
        self.plugins
            .iter()
            .chain(std::iter::once(&self.fallback))
            .find(|e| e.name().eq_ignore_ascii_case(name.trim()))
            .cloned()
    }

    /// Pick the single extractor for `url`.
    pub fn extractor_for(&self, url: &str, assignment: Option<&str>) -> DynExtractor {
        if let Some(name) = assignment {
            match self.by_name(name) {
                Some(e) => return e,
                None => {
                    tracing::warn!(url, extractor = name, "unknown extractor assignment, using auto");
                }
            }
        }
        self.plugins
            .iter()
            .find(|e| e.can_handle(url))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Run `extractor` and normalize its output. Never fails: errors are
    /// logged and yield an empty list.
    pub async fn run(&self, extractor: &dyn Extractor, input: &ExtractInput<'_>) -> Vec<ExtractedLink> {
        ensure_metrics_described();
        let t0 = std::time::Instant::now();
        let raw = match extractor.extract(input).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    error = ?e,
                    extractor = extractor.name(),
                    url = input.source_url,
                    "extractor failed"
                );
                counter!("linkpost_extractor_errors_total").increment(1);
                return Vec::new();
            }
        };
        let out = normalize_links(input.source_url, raw);
        histogram!("linkpost_extract_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("linkpost_extract_links_total").increment(out.len() as u64);
        tracing::debug!(
            extractor = extractor.name(),
            url = input.source_url,
            links = out.len(),
            "extracted"
        );
        out
    }
}

/// Resolve relative hrefs, drop non-web links, tidy titles, collapse
/// duplicates by fingerprint (first occurrence wins).
pub fn normalize_links(source_url: &str, raw: Vec<ExtractedLink>) -> Vec<ExtractedLink> {
    let base = url::Url::parse(source_url).ok();
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for link in raw {
        let Some(url) = resolve_href(base.as_ref(), &link.url) else {
            continue;
        };
        let title = match clean_text(&link.title) {
            t if t.is_empty() => url.clone(),
            t => t,
        };
        let link = ExtractedLink {
            title,
            url,
            published_date: link.published_date,
        };
        if seen.insert(link.fingerprint()) {
            out.push(link);
        }
    }
    out
}

/// Absolute http(s) URL without fragment, or `None`.
pub fn resolve_href(base: Option<&url::Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut resolved = match base {
        Some(b) => b.join(href).ok()?,
        None => url::Url::parse(href).ok()?,
    };
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

/// Decode entities, strip tags, collapse whitespace.
pub fn clean_text(s: &str) -> String {
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("ws regex"));
    let out = re_tags.replace_all(s, " ");
    let out = html_escape::decode_html_entities(&out);
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// True when `url`'s host equals or is a subdomain of any listed host.
pub fn host_matches(url: &str, hosts: &[String]) -> bool {
    let Some(host) = url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
        return false;
    };
    hosts.iter().any(|h| {
        let h = h.trim().trim_start_matches('.').to_ascii_lowercase();
        !h.is_empty() && (host == h || host.ends_with(&format!(".{h}")))
    })
}

/// Whether free text names `date`, in any of the usual page formats.
/// "today" counts when `allow_relative` is set.
pub fn mentions_date(text: &str, date: NaiveDate, allow_relative: bool) -> bool {
    static RE_ORD: OnceCell<Regex> = OnceCell::new();
    let re_ord =
        RE_ORD.get_or_init(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").expect("ordinal regex"));
    let lowered = clean_text(text).to_lowercase();
    let hay = re_ord.replace_all(&lowered, "$1").replace(',', " ");
    let hay = hay.split_whitespace().collect::<Vec<_>>().join(" ");

    if allow_relative && contains_token(&hay, "today") {
        return true;
    }
    const FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%B %-d %Y",
        "%-d %B %Y",
        "%b %-d %Y",
        "%-d %b %Y",
        "%m/%d/%Y",
        "%-m/%-d/%Y",
        "%d.%m.%Y",
        "%-d.%-m.%Y",
        "%B %-d",
        "%-d %B",
    ];
    FORMATS.iter().any(|f| {
        let needle = date.format(f).to_string().to_lowercase();
        contains_token(&hay, &needle)
    })
}

/// Substring match that refuses to split a number or word at either end.
fn contains_token(hay: &str, needle: &str) -> bool {
    let mut from = 0;
    while let Some(pos) = hay[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = hay[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = hay[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        from = start + needle.len().max(1);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    struct Fixed(&'static str, bool, u32);

    #[async_trait]
    impl Extractor for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
        fn can_handle(&self, _url: &str) -> bool {
            self.1
        }
        async fn extract(&self, _input: &ExtractInput<'_>) -> Result<Vec<ExtractedLink>> {
            anyhow::bail!("boom")
        }
        fn lookback_days(&self) -> u32 {
            self.2
        }
    }

    fn registry() -> ExtractorRegistry {
        ExtractorRegistry::new(
            vec![
                Arc::new(Fixed("never", false, 0)),
                Arc::new(Fixed("claims", true, 1)),
                Arc::new(Fixed("also-claims", true, 0)),
            ],
            Arc::new(Fixed("fallback", true, 0)),
        )
    }

    #[test]
    fn selection_follows_priority() {
        let r = registry();
        assert_eq!(r.extractor_for("https://a.test/", None).name(), "claims");
        assert_eq!(r.extractor_for("https://a.test/", Some("never")).name(), "never");
        assert_eq!(r.extractor_for("https://a.test/", Some("NOPE")).name(), "claims");
        let only_fallback = ExtractorRegistry::new(vec![], Arc::new(Fixed("fallback", true, 0)));
        assert_eq!(only_fallback.extractor_for("https://a.test/", None).name(), "fallback");
    }

    #[tokio::test]
    async fn extractor_errors_become_zero_links() {
        let r = registry();
        let e = r.extractor_for("https://a.test/", None);
        let input = ExtractInput {
            source_url: "https://a.test/",
            html: "",
            date: d("2026-10-19"),
            tz: Tz::UTC,
        };
        assert!(r.run(e.as_ref(), &input).await.is_empty());
    }

    #[test]
    fn normalize_resolves_and_collapses() {
        let day = d("2026-10-19");
        let raw = vec![
            ExtractedLink::new("  A&amp;B ", "/a#top", day),
            ExtractedLink::new("dup", "https://s.test/a", day),
            ExtractedLink::new("mail", "mailto:x@y.z", day),
            ExtractedLink::new("", "b", day),
        ];
        let out = normalize_links("https://s.test/list/", raw);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].title, "A&B");
        assert_eq!(out[0].url, "https://s.test/a");
        assert_eq!(out[1].title, "https://s.test/list/b");
    }

    #[test]
    fn date_mentions_cover_common_formats() {
        let day = d("2026-10-09");
        assert!(mentions_date("Links for October 9th, 2026", day, false));
        assert!(mentions_date("<b>9 October 2026</b>", day, false));
        assert!(mentions_date("Updated 2026-10-09", day, false));
        assert!(mentions_date("10/09/2026 rewards", day, false));
        assert!(mentions_date("Oct 9, 2026", day, false));
        assert!(!mentions_date("October 19, 2026", day, false));
        assert!(!mentions_date("Today's links", day, false));
        assert!(mentions_date("Today's links", day, true));
    }

    #[test]
    fn host_matching_includes_subdomains() {
        let hosts = vec!["example.com".to_string()];
        assert!(host_matches("https://news.example.com/x", &hosts));
        assert!(host_matches("https://example.com/", &hosts));
        assert!(!host_matches("https://badexample.com/", &hosts));
    }
}
