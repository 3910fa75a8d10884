//! # Fingerprint dedup
//! Per (post, site, day) sets of already-written link fingerprints.
//!
//! Keys are (url, date), so a URL may legitimately come back on a later day.
//! Fingerprints are appended only after a confirmed write, always under the
//! run's target day.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::model::{preceding_days, ExtractedLink, Fingerprint};

/// The read-only view dedup runs against.
#[derive(Debug, Clone, Default)]
pub struct KnownFingerprints {
    set: HashSet<Fingerprint>,
    /// Preceding days consulted because of lookback (empty without lookback).
    window: Vec<NaiveDate>,
}

impl KnownFingerprints {
    pub fn new(set: HashSet<Fingerprint>, window: Vec<NaiveDate>) -> Self {
        Self { set, window }
    }

    /// Exact fingerprint hit, or, under lookback, the same URL recorded for
    /// any day of the window.
    pub fn contains(&self, link: &ExtractedLink) -> bool {
        self.set.contains(&link.fingerprint())
            || self
                .window
                .iter()
                .any(|d| self.set.contains(&Fingerprint::of(&link.url, *d)))
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Links whose fingerprint is not known yet, first occurrence wins.
pub fn dedupe(links: &[ExtractedLink], known: &KnownFingerprints) -> Vec<ExtractedLink> {
    let mut seen = HashSet::new();
    links
        .iter()
        .filter(|l| !known.contains(l) && seen.insert(l.fingerprint()))
        .cloned()
        .collect()
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn load_day(&self, post_id: &str, site: &str, date: NaiveDate) -> Result<HashSet<Fingerprint>>;

    /// Union `fps` into the (post, site, date) set.
    async fn append(&self, post_id: &str, site: &str, date: NaiveDate, fps: &[Fingerprint]) -> Result<()>;

    /// The target day's set plus `lookback_days` preceding days.
    async fn load(
        &self,
        post_id: &str,
        site: &str,
        date: NaiveDate,
        lookback_days: u32,
    ) -> Result<KnownFingerprints> {
        let window = preceding_days(date, lookback_days);
        let mut set = self.load_day(post_id, site, date).await?;
        for d in &window {
            set.extend(self.load_day(post_id, site, *d).await?);
        }
        Ok(KnownFingerprints::new(set, window))
    }
}

type DayKey = (String, String, NaiveDate);

#[derive(Default)]
pub struct MemoryFingerprintStore {
    sets: RwLock<HashMap<DayKey, HashSet<Fingerprint>>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn load_day(&self, post_id: &str, site: &str, date: NaiveDate) -> Result<HashSet<Fingerprint>> {
        let key = (post_id.to_string(), site.to_string(), date);
        Ok(self.sets.read().await.get(&key).cloned().unwrap_or_default())
    }

    async fn append(&self, post_id: &str, site: &str, date: NaiveDate, fps: &[Fingerprint]) -> Result<()> {
        let key = (post_id.to_string(), site.to_string(), date);
        self.sets
            .write()
            .await
            .entry(key)
            .or_default()
            .extend(fps.iter().cloned());
        Ok(())
    }
}

/// One JSON array per (post, site, day) under `<dir>/fingerprints/`,
/// rewritten atomically (tmp + rename) under a per-key lock.
pub struct FileFingerprintStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileFingerprintStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            root: dir.as_ref().join("fingerprints"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, post_id: &str, site: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(safe_component(post_id))
            .join(safe_component(site))
            .join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    async fn read_set(path: &Path) -> Result<HashSet<Fingerprint>> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => {
                let v: Vec<Fingerprint> = serde_json::from_str(&s)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(v.into_iter().collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[async_trait]
impl FingerprintStore for FileFingerprintStore {
    async fn load_day(&self, post_id: &str, site: &str, date: NaiveDate) -> Result<HashSet<Fingerprint>> {
        Self::read_set(&self.path_for(post_id, site, date)).await
    }

    async fn append(&self, post_id: &str, site: &str, date: NaiveDate, fps: &[Fingerprint]) -> Result<()> {
        if fps.is_empty() {
            return Ok(());
        }
        let path = self.path_for(post_id, site, date);
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        let mut set = Self::read_set(&path).await?;
        set.extend(fps.iter().cloned());
        let mut sorted: Vec<_> = set.into_iter().collect();
        sorted.sort();
        write_json_atomic(&path, &sorted).await
    }
}

/// Keep store keys filesystem-safe without losing uniqueness for sane ids.
pub(crate) fn safe_component(s: &str) -> String {
    let out: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match out.as_str() {
        "" | "." | ".." => format!("_{out}"),
        _ => out,
    }
}

pub(crate) async fn write_json_atomic<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn same_url_on_different_days_both_survive() {
        let links = vec![
            ExtractedLink::new("A", "https://s.test/a", d("2026-10-19")),
            ExtractedLink::new("A", "https://s.test/a", d("2026-10-18")),
        ];
        let out = dedupe(&links, &KnownFingerprints::default());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn exact_fingerprint_is_dropped_and_in_batch_duplicates_collapse() {
        let a = ExtractedLink::new("A", "https://s.test/a", d("2026-10-19"));
        let b = ExtractedLink::new("B", "https://s.test/b", d("2026-10-19"));
        let known = KnownFingerprints::new([a.fingerprint()].into_iter().collect(), vec![]);
        let out = dedupe(&[a, b.clone(), b.clone()], &known);
        assert_eq!(out, vec![b]);
    }

    #[test]
    fn without_lookback_yesterday_is_not_consulted() {
        let today = ExtractedLink::new("A", "https://s.test/a", d("2026-10-19"));
        let known = KnownFingerprints::new(
            [Fingerprint::of("https://s.test/a", d("2026-10-18"))].into_iter().collect(),
            vec![],
        );
        assert!(!known.contains(&today));
    }

    #[tokio::test]
    async fn lookback_suppresses_link_seen_yesterday() {
        let store = MemoryFingerprintStore::new();
        let yesterday = d("2026-10-18");
        store
            .append("p", "main", yesterday, &[Fingerprint::of("https://s.test/a", yesterday)])
            .await
            .unwrap();

        let today = d("2026-10-19");
        let again = ExtractedLink::new("A", "https://s.test/a", today);

        let no_lb = store.load("p", "main", today, 0).await.unwrap();
        assert_eq!(dedupe(&[again.clone()], &no_lb).len(), 1);

        let lb = store.load("p", "main", today, 1).await.unwrap();
        assert!(dedupe(&[again], &lb).is_empty());
    }

    #[tokio::test]
    async fn namespaces_are_per_site() {
        let store = MemoryFingerprintStore::new();
        let day = d("2026-10-19");
        let fp = Fingerprint::of("https://s.test/a", day);
        store.append("p", "a", day, &[fp.clone()]).await.unwrap();
        assert!(store.load_day("p", "a", day).await.unwrap().contains(&fp));
        assert!(store.load_day("p", "b", day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_unions_concurrent_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileFingerprintStore::new(tmp.path()));
        let day = d("2026-10-19");

        let mut handles = Vec::new();
        for i in 0..8 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                let fp = Fingerprint::of(&format!("https://s.test/{i}"), day);
                s.append("post/1", "main", day, &[fp]).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let set = store.load_day("post/1", "main", day).await.unwrap();
        assert_eq!(set.len(), 8);
        assert!(tmp.path().join("fingerprints/post_1/main/2026-10-19.json").exists());
    }

    #[test]
    fn unsafe_path_components_are_neutralized() {
        assert_eq!(safe_component("../x"), ".._x");
        assert_eq!(safe_component(".."), "_..");
        assert_eq!(safe_component("blog.example.com"), "blog.example.com");
    }
}
