//! # Data model
//! Value types shared by extraction, dedup, section mutation and batching.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Separator between URL and date inside a fingerprint.
pub const FINGERPRINT_SEP: &str = "|";

pub const DEFAULT_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_HEADING_FORMAT: &str = "%B %-d, %Y";

/// One candidate link found on a source page (or supplied manually).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExtractedLink {
    pub title: String,
    pub url: String,
    pub published_date: NaiveDate,
}

impl ExtractedLink {
    pub fn new(title: impl Into<String>, url: impl Into<String>, published_date: NaiveDate) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            published_date,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.url, self.published_date)
    }
}

/// `url ++ "|" ++ YYYY-MM-DD`. Compared by exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(url: &str, date: NaiveDate) -> Self {
        Self(format!("{url}{FINGERPRINT_SEP}{}", date.format("%Y-%m-%d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a brand-new section goes when no section for the date exists yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "kebab-case")]
pub enum InsertionPolicy {
    #[default]
    Prepend,
    AfterHeadingId(String),
    AfterHeadingText(String),
}

/// Per logical post configuration. Owned by the external config surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub content_identity: String,
    pub source_urls: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// source url (or `*`) -> extractor name or `auto`
    #[serde(default)]
    pub extractor_assignment: BTreeMap<String, String>,
    /// site key -> native document id
    #[serde(default)]
    pub site_targets: BTreeMap<String, String>,
    #[serde(default)]
    pub insertion_policy: InsertionPolicy,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Overrides the service-wide home site for `TargetSelector::Default`.
    #[serde(default)]
    pub default_site: Option<String>,
    #[serde(default = "default_heading_format")]
    pub heading_format: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_heading_format() -> String {
    DEFAULT_HEADING_FORMAT.to_string()
}

impl SourceConfig {
    /// Minimal config used by tests and the manual entry point.
    pub fn new(content_identity: impl Into<String>, source_urls: Vec<String>) -> Self {
        Self {
            content_identity: content_identity.into(),
            source_urls,
            timezone: default_timezone(),
            extractor_assignment: BTreeMap::new(),
            site_targets: BTreeMap::new(),
            insertion_policy: InsertionPolicy::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
            default_site: None,
            heading_format: default_heading_format(),
        }
    }

    /// Explicit extractor name for `url`, or `None` for automatic selection.
    pub fn assignment_for(&self, url: &str) -> Option<&str> {
        self.extractor_assignment
            .get(url)
            .or_else(|| self.extractor_assignment.get("*"))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("auto"))
    }

    pub fn tz(&self) -> Result<Tz> {
        parse_timezone(&self.timezone)
    }

    /// Calendar day of `at` in the post's timezone.
    pub fn day_at(&self, at: DateTime<Utc>) -> Result<NaiveDate> {
        Ok(at.with_timezone(&self.tz()?).date_naive())
    }

    /// The post's current calendar day in its configured timezone.
    pub fn today(&self) -> Result<NaiveDate> {
        self.day_at(Utc::now())
    }
}

/// An IANA zone name (`Europe/Prague`), or `UTC` / `Z`.
pub fn parse_timezone(raw: &str) -> Result<Tz> {
    let s = raw.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("utc") || s.eq_ignore_ascii_case("z") {
        return Ok(Tz::UTC);
    }
    s.parse::<Tz>()
        .map_err(|e| anyhow!("unknown timezone '{raw}': {e}"))
}

/// The `n` days strictly before `date`, most recent first.
pub fn preceding_days(date: NaiveDate, n: u32) -> Vec<NaiveDate> {
    (1..=i64::from(n)).map(|i| date - Duration::days(i)).collect()
}

/// Which configured sites a request writes to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetSelector {
    /// The post's default (home) site only.
    #[default]
    Default,
    /// Every site listed in the post's `site_targets`.
    All,
    /// One named site key.
    Site(String),
}

impl FromStr for TargetSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(anyhow!("empty target selector")),
            t if t.eq_ignore_ascii_case("default") || t.eq_ignore_ascii_case("this") => {
                Ok(Self::Default)
            }
            t if t.eq_ignore_ascii_case("all") => Ok(Self::All),
            t => Ok(Self::Site(t.to_string())),
        }
    }
}

impl TryFrom<String> for TargetSelector {
    type Error = anyhow::Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TargetSelector> for String {
    fn from(t: TargetSelector) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::All => f.write_str("all"),
            Self::Site(s) => f.write_str(s),
        }
    }
}

/// A (site, native document id) pair a section is written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub site: String,
    pub native_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn fingerprint_keys_url_and_date() {
        let a = ExtractedLink::new("A", "https://x.test/a", d("2026-10-19"));
        let b = ExtractedLink::new("A again", "https://x.test/a", d("2026-10-18"));
        assert_eq!(a.fingerprint().as_str(), "https://x.test/a|2026-10-19");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn assignment_auto_means_none() {
        let mut cfg = SourceConfig::new("daily", vec!["https://s.test/".into()]);
        assert_eq!(cfg.assignment_for("https://s.test/"), None);
        cfg.extractor_assignment
            .insert("https://s.test/".into(), "auto".into());
        assert_eq!(cfg.assignment_for("https://s.test/"), None);
        cfg.extractor_assignment.insert("*".into(), "feed".into());
        cfg.extractor_assignment.remove("https://s.test/");
        assert_eq!(cfg.assignment_for("https://s.test/"), Some("feed"));
    }

    #[test]
    fn timezones_parse() {
        assert_eq!(parse_timezone("UTC").unwrap(), Tz::UTC);
        assert_eq!(parse_timezone(" z ").unwrap(), Tz::UTC);
        assert_eq!(parse_timezone("Europe/Prague").unwrap(), Tz::Europe__Prague);
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn today_follows_daylight_saving() {
        let mut cfg = SourceConfig::new("daily", vec![]);
        cfg.timezone = "America/New_York".into();
        let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        // EDT (-4): 03:30Z is still the previous evening.
        assert_eq!(cfg.day_at(at("2026-07-01T03:30:00Z")).unwrap(), d("2026-06-30"));
        // EST (-5): 04:30Z is 23:30 on New Year's Eve.
        assert_eq!(cfg.day_at(at("2026-01-01T04:30:00Z")).unwrap(), d("2025-12-31"));
        assert_eq!(cfg.day_at(at("2026-01-01T05:30:00Z")).unwrap(), d("2026-01-01"));
    }

    #[test]
    fn selector_round_trips_through_strings() {
        assert_eq!("all".parse::<TargetSelector>().unwrap(), TargetSelector::All);
        assert_eq!(
            "default".parse::<TargetSelector>().unwrap(),
            TargetSelector::Default
        );
        assert_eq!(
            "blog-b".parse::<TargetSelector>().unwrap(),
            TargetSelector::Site("blog-b".into())
        );
        let json = serde_json::to_string(&TargetSelector::All).unwrap();
        assert_eq!(json, "\"all\"");
    }

    #[test]
    fn insertion_policy_from_toml() {
        #[derive(Deserialize)]
        struct W {
            p: InsertionPolicy,
        }
        let w: W = toml::from_str(r#"p = { mode = "after-heading-text", value = "Today" }"#)
            .unwrap();
        assert_eq!(w.p, InsertionPolicy::AfterHeadingText("Today".into()));
        let w: W = toml::from_str(r#"p = { mode = "prepend" }"#).unwrap();
        assert_eq!(w.p, InsertionPolicy::Prepend);
    }

    #[test]
    fn preceding_days_excludes_today() {
        let days = preceding_days(d("2026-10-19"), 2);
        assert_eq!(days, vec![d("2026-10-18"), d("2026-10-17")]);
    }
}
