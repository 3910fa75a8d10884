//! Structural extraction: find the heading that names the target date and
//! collect the links that follow it, up to the next heading of the same or
//! higher rank.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::{host_matches, mentions_date, ExtractInput, Extractor};
use crate::model::ExtractedLink;

pub const NAME: &str = "heading-date";

static HEADINGS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").expect("static heading selector"));
static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("static anchor selector"));

/// Never auto-claims a URL unless its host is configured; it is also the
/// second-level fallback behind the AI extractor.
pub struct HeadingDateExtractor {
    hosts: Vec<String>,
}

impl HeadingDateExtractor {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Extractor for HeadingDateExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_handle(&self, url: &str) -> bool {
        host_matches(url, &self.hosts)
    }

    async fn extract(&self, input: &ExtractInput<'_>) -> Result<Vec<ExtractedLink>> {
        Ok(links_under_date_heading(input.html, input.date))
    }
}

fn heading_rank(el: &ElementRef) -> Option<u8> {
    match el.value().name() {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

/// Links following the first heading whose text names `date`.
pub fn links_under_date_heading(html: &str, date: NaiveDate) -> Vec<ExtractedLink> {
    let doc = Html::parse_document(html);

    let Some(heading) = doc.select(&HEADINGS).find(|h| {
        let text = h.text().collect::<Vec<_>>().join(" ");
        mentions_date(&text, date, true)
    }) else {
        return Vec::new();
    };
    let rank = heading_rank(&heading).unwrap_or(6);

    // Headings are often wrapped (`<div class="day"><h2>..</h2></div><ul>..`);
    // climb a couple of levels while nothing follows the current node.
    let mut anchor = heading;
    for _ in 0..3 {
        let (links, stopped) = collect_following(anchor, rank, date);
        if !links.is_empty() || stopped {
            return links;
        }
        match anchor.parent().and_then(ElementRef::wrap) {
            Some(parent) if parent.value().name() != "body" => anchor = parent,
            _ => break,
        }
    }
    Vec::new()
}

/// Returns the links among `start`'s following siblings and whether a
/// terminating heading was reached.
fn collect_following(start: ElementRef, rank: u8, date: NaiveDate) -> (Vec<ExtractedLink>, bool) {
    let mut out = Vec::new();
    for node in start.next_siblings() {
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        if heading_rank(&el).is_some_and(|r| r <= rank) {
            return (out, true);
        }
        if el
            .select(&HEADINGS)
            .any(|h| heading_rank(&h).is_some_and(|r| r <= rank))
        {
            return (out, true);
        }
        if el.value().name() == "a" {
            push_anchor(&el, date, &mut out);
        }
        for a in el.select(&ANCHORS) {
            push_anchor(&a, date, &mut out);
        }
    }
    (out, false)
}

fn push_anchor(a: &ElementRef, date: NaiveDate, out: &mut Vec<ExtractedLink>) {
    let Some(href) = a.value().attr("href") else {
        return;
    };
    let title = a.text().collect::<Vec<_>>().join(" ");
    out.push(ExtractedLink::new(title, href, date));
}
