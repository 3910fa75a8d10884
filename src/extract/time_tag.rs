use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::{host_matches, ExtractInput, Extractor};
use crate::model::ExtractedLink;

pub const NAME: &str = "time-tag";

static ENTRIES: Lazy<Selector> =
    Lazy::new(|| Selector::parse("article, li, .post, .entry").expect("static entry selector"));
static TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time[datetime]").expect("static time selector"));
static HEADING_LINK: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("h1 a[href], h2 a[href], h3 a[href], h4 a[href], h5 a[href], h6 a[href]")
        .expect("static heading link selector")
});
static ANY_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("static anchor selector"));

/// Blog/archive layouts where every entry carries `<time datetime=..>`.
pub struct TimeTagExtractor {
    hosts: Vec<String>,
}

impl TimeTagExtractor {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    pub fn parse_entries(html: &str, date: NaiveDate, tz: Tz) -> Vec<ExtractedLink> {
        let doc = Html::parse_document(html);
        let mut out = Vec::new();
        for entry in doc.select(&ENTRIES) {
            let Some(day) = entry
                .select(&TIME)
                .next()
                .and_then(|t| t.value().attr("datetime"))
                .and_then(|raw| entry_day(raw, tz))
            else {
                continue;
            };
            if day != date {
                continue;
            }
            if let Some(link) = entry_link(&entry) {
                let title = link.text().collect::<Vec<_>>().join(" ");
                if let Some(href) = link.value().attr("href") {
                    out.push(ExtractedLink::new(title, href, date));
                }
            }
        }
        out
    }
}

/// Full timestamps are shifted into the post's timezone; bare dates are taken as-is.
fn entry_day(raw: &str, tz: Tz) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz).date_naive());
    }
    raw.get(..10)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn entry_link<'a>(entry: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    entry
        .select(&HEADING_LINK)
        .next()
        .or_else(|| entry.select(&ANY_LINK).next())
}

#[async_trait]
impl Extractor for TimeTagExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_handle(&self, url: &str) -> bool {
        host_matches(url, &self.hosts)
    }

    async fn extract(&self, input: &ExtractInput<'_>) -> Result<Vec<ExtractedLink>> {
        Ok(Self::parse_entries(input.html, input.date, input.tz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn picks_heading_link_of_entries_on_date() {
        let html = r#"<main>
<article><h2><a href="/p/1">First post</a></h2><time datetime="2026-10-19T09:00:00+00:00">Oct 19</time>
  <p><a href="/tag/x">tag</a></p></article>
<article><h2><a href="/p/0">Yesterday</a></h2><time datetime="2026-10-18">Oct 18</time></article>
<article><time datetime="2026-10-19"></time><a href="/p/2">Second</a></article>
</main>"#;
        let out = TimeTagExtractor::parse_entries(html, d("2026-10-19"), Tz::UTC);
        let urls: Vec<_> = out.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(urls, vec!["/p/1", "/p/2"]);
        assert_eq!(out[0].title, "First post");
    }

    #[test]
    fn only_configured_hosts_are_claimed() {
        let e = TimeTagExtractor::new(vec!["news.test".into()]);
        assert!(e.can_handle("https://news.test/archive"));
        assert!(!e.can_handle("https://other.test/archive"));
    }
}
