use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

use super::{host_matches, mentions_date, ExtractInput, Extractor};
use crate::model::{preceding_days, ExtractedLink};

pub const NAME: &str = "dated-table";

/// Rows dated up to this many days back are still surfaced; dedup must
/// consult the same window.
pub const LOOKBACK_DAYS: u32 = 1;

static ROWS: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("static row selector"));
static CELLS: Lazy<Selector> = Lazy::new(|| Selector::parse("td, th").expect("static cell selector"));
static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("static anchor selector"));

/// Pages that list links in table rows with a date column, keeping
/// yesterday's rows visible.
pub struct DatedTableExtractor {
    hosts: Vec<String>,
}

impl DatedTableExtractor {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    pub fn parse_rows(html: &str, date: NaiveDate) -> Vec<ExtractedLink> {
        let mut window = vec![date];
        window.extend(preceding_days(date, LOOKBACK_DAYS));

        let doc = Html::parse_document(html);
        let mut out = Vec::new();
        for row in doc.select(&ROWS) {
            let cells: Vec<_> = row.select(&CELLS).collect();
            let row_day = cells.iter().find_map(|c| {
                let text = c.text().collect::<Vec<_>>().join(" ");
                window.iter().copied().find(|d| mentions_date(&text, *d, false))
            });
            let Some(day) = row_day else {
                continue;
            };
            for a in row.select(&ANCHORS) {
                if let Some(href) = a.value().attr("href") {
                    let title = a.text().collect::<Vec<_>>().join(" ");
                    out.push(ExtractedLink::new(title, href, day));
                }
            }
        }
        out
    }
}

#[async_trait]
impl Extractor for DatedTableExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_handle(&self, url: &str) -> bool {
        host_matches(url, &self.hosts)
    }

    async fn extract(&self, input: &ExtractInput<'_>) -> Result<Vec<ExtractedLink>> {
        Ok(Self::parse_rows(input.html, input.date))
    }

    fn lookback_days(&self) -> u32 {
        LOOKBACK_DAYS
    }
}
