use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use quick_xml::de::from_str;
use serde::Deserialize;

use super::{host_matches, ExtractInput, Extractor};
use crate::model::ExtractedLink;

pub const NAME: &str = "feed";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

/// RSS 2.0 items published on the target day (in the post's timezone).
pub struct FeedExtractor {
    hosts: Vec<String>,
}

impl FeedExtractor {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    pub fn parse_items(xml: &str, date: NaiveDate, tz: Tz) -> Result<Vec<ExtractedLink>> {
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;

        let mut out = Vec::new();
        for it in rss.channel.item {
            let Some(link) = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) else {
                continue;
            };
            let day = it
                .pub_date
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc2822(ts.trim()).ok())
                .map(|dt| dt.with_timezone(&tz).date_naive());
            if day != Some(date) {
                continue;
            }
            out.push(ExtractedLink::new(it.title.unwrap_or_default(), link, date));
        }
        Ok(out)
    }
}

fn looks_like_feed(url: &str) -> bool {
    let Ok(u) = url::Url::parse(url) else {
        return false;
    };
    let path = u.path().trim_end_matches('/').to_ascii_lowercase();
    path.ends_with("/feed")
        || path.ends_with("/rss")
        || path.ends_with("/atom")
        || path.ends_with(".xml")
        || path.ends_with(".rss")
}

#[async_trait]
impl Extractor for FeedExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_handle(&self, url: &str) -> bool {
        looks_like_feed(url) || host_matches(url, &self.hosts)
    }

    async fn extract(&self, input: &ExtractInput<'_>) -> Result<Vec<ExtractedLink>> {
        Self::parse_items(input.html, input.date, input.tz)
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Daily</title>
<item><title>Late evening link</title><link>https://s.test/late</link>
  <pubDate>Sun, 18 Oct 2026 23:30:00 +0000</pubDate></item>
<item><title>Morning link&nbsp;</title><link>https://s.test/morning</link>
  <pubDate>Mon, 19 Oct 2026 08:00:00 +0000</pubDate></item>
<item><title>No date</title><link>https://s.test/nodate</link></item>
</channel></rss>"#;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn items_are_bucketed_by_post_timezone() {
        let out = FeedExtractor::parse_items(XML, d("2026-10-19"), Tz::UTC).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "https://s.test/morning");

        // Prague is on CEST (+02:00) in October: the 23:30 UTC item lands on the 19th.
        let out = FeedExtractor::parse_items(XML, d("2026-10-19"), Tz::Europe__Prague).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn claims_feed_shaped_urls() {
        let f = FeedExtractor::new(vec![]);
        assert!(f.can_handle("https://blog.test/feed/"));
        assert!(f.can_handle("https://blog.test/news.xml"));
        assert!(!f.can_handle("https://blog.test/today"));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(FeedExtractor::parse_items("<html>", d("2026-10-19"), Tz::UTC).is_err());
    }
}
