//! # Single-post pipeline
//! config -> targets -> fetch -> extract -> dedupe -> mutate, for one post.
//!
//! Failures are contained here: `run_post` always ends with a terminal status
//! on the post's state and never returns an error. Extraction runs once per
//! post; only the mutation step repeats per target, each target with its own
//! fingerprint namespace.

use chrono::NaiveDate;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::batch::{BatchStore, PostStatus, PostUpdateState, TargetState, TargetStatus};
use crate::config::ConfigStore;
use crate::document::DocumentStore;
use crate::error::{with_timeout, PipelineError, PipelineResult};
use crate::extract::{ExtractInput, ExtractorRegistry};
use crate::fetch::HtmlFetcher;
use crate::fingerprint::{dedupe, FingerprintStore, KnownFingerprints};
use crate::model::{ExtractedLink, Fingerprint, SourceConfig, Target, TargetSelector};
use crate::section::{apply_section, SectionRequest};
use crate::targets::resolve_targets;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("linkpost_links_added_total", "Links written into target documents.");
        describe_counter!("linkpost_dedup_total", "Candidate links dropped as already known.");
        describe_counter!(
            "linkpost_mutation_failures_total",
            "Target document reads/writes that failed."
        );
        describe_histogram!("linkpost_pipeline_ms", "Wall time of one post pipeline.");
    });
}

/// Owns one post's state and mirrors every change into the batch store.
pub struct PostTracker {
    store: Option<Arc<dyn BatchStore>>,
    request_id: String,
    state: PostUpdateState,
}

impl PostTracker {
    pub fn new(store: Arc<dyn BatchStore>, request_id: impl Into<String>, state: PostUpdateState) -> Self {
        Self {
            store: Some(store),
            request_id: request_id.into(),
            state,
        }
    }

    /// A tracker that keeps state in memory only (manual adds).
    pub fn detached(post_id: &str, log_capacity: usize) -> Self {
        Self {
            store: None,
            request_id: String::new(),
            state: PostUpdateState::new(post_id, log_capacity),
        }
    }

    pub fn state(&self) -> &PostUpdateState {
        &self.state
    }

    fn post_id(&self) -> &str {
        &self.state.post_id
    }

    async fn flush(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.upsert_post(&self.request_id, &self.state).await {
            warn!(request_id = %self.request_id, post_id = %self.post_id(), error = ?e, "batch state upsert failed");
        }
    }

    pub async fn stage(&mut self, progress: u8, line: impl AsRef<str>) {
        info!(request_id = %self.request_id, post_id = %self.post_id(), progress, "{}", line.as_ref());
        self.state.log(line);
        self.state.advance(progress);
        self.flush().await;
    }

    pub async fn warn(&mut self, line: impl AsRef<str>) {
        warn!(request_id = %self.request_id, post_id = %self.post_id(), "{}", line.as_ref());
        self.state.log(line);
        self.flush().await;
    }

    pub async fn start(&mut self) {
        self.state.set_status(PostStatus::Running, "running");
        self.stage(1, "started").await;
    }

    pub async fn finish(&mut self, status: PostStatus, message: impl Into<String>) {
        let message = message.into();
        self.state.log(format!("finished as {status:?}: {message}"));
        if !self.state.set_status(status, message.clone()) {
            warn!(post_id = %self.post_id(), ?status, "ignored status regression");
        }
        info!(request_id = %self.request_id, post_id = %self.post_id(), ?status, %message, "post finished");
        self.flush().await;
    }
}

/// A caller-supplied link for the manual entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualLink {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualAddOutcome {
    pub added: usize,
    pub duplicates: usize,
    pub targets: BTreeMap<String, TargetState>,
}

pub struct Pipeline {
    configs: Arc<dyn ConfigStore>,
    fetcher: Arc<dyn HtmlFetcher>,
    registry: Arc<ExtractorRegistry>,
    fingerprints: Arc<dyn FingerprintStore>,
    documents: Arc<dyn DocumentStore>,
    home_site: Option<String>,
    io_timeout_secs: u64,
}

/// What happened on one target.
struct Mutation {
    state: TargetState,
    /// Links that survived dedup (before section-level URL checks).
    fresh: usize,
}

impl Pipeline {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        fetcher: Arc<dyn HtmlFetcher>,
        registry: Arc<ExtractorRegistry>,
        fingerprints: Arc<dyn FingerprintStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            configs,
            fetcher,
            registry,
            fingerprints,
            documents,
            home_site: None,
            io_timeout_secs: 30,
        }
    }

    pub fn with_home_site(mut self, site: Option<String>) -> Self {
        self.home_site = site;
        self
    }

    pub fn with_io_timeout(mut self, secs: u64) -> Self {
        self.io_timeout_secs = secs.max(1);
        self
    }

    async fn load_config(&self, post_id: &str) -> PipelineResult<SourceConfig> {
        with_timeout("config", self.io_timeout_secs, self.configs.get_config(post_id))
            .await?
            .ok_or_else(|| PipelineError::ConfigurationMissing {
                post_id: post_id.to_string(),
            })
    }

    /// Run the whole pipeline for `post_id`; the final status is recorded on
    /// the tracker and returned.
    pub async fn run_post(&self, post_id: &str, selector: &TargetSelector, tracker: &mut PostTracker) -> PostStatus {
        ensure_metrics_described();
        let t0 = Instant::now();
        tracker.start().await;
        let (status, message) = match self.run_inner(post_id, selector, tracker).await {
            Ok(done) => done,
            Err(e) => {
                warn!(post_id, kind = e.kind(), error = %e, "post pipeline failed");
                (PostStatus::Failed, e.to_string())
            }
        };
        tracker.finish(status, message).await;
        histogram!("linkpost_pipeline_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        status
    }

    async fn run_inner(
        &self,
        post_id: &str,
        selector: &TargetSelector,
        tracker: &mut PostTracker,
    ) -> PipelineResult<(PostStatus, String)> {
        let cfg = self.load_config(post_id).await?;
        let tz = cfg
            .tz()
            .map_err(|e| PipelineError::ValidationError(e.to_string()))?;
        let date = cfg
            .today()
            .map_err(|e| PipelineError::ValidationError(e.to_string()))?;
        tracker
            .stage(10, format!("config loaded: {} source(s), date {date}", cfg.source_urls.len()))
            .await;

        let targets = resolve_targets(post_id, &cfg, selector, self.home_site.as_deref())?;
        let plan: Vec<_> = cfg
            .source_urls
            .iter()
            .map(|url| (url.as_str(), self.registry.extractor_for(url, cfg.assignment_for(url))))
            .collect();
        let lookback = plan.iter().map(|(_, e)| e.lookback_days()).max().unwrap_or(0);
        tracker
            .stage(
                15,
                format!(
                    "targets: {}; lookback {lookback} day(s)",
                    targets.iter().map(|t| t.site.as_str()).collect::<Vec<_>>().join(", ")
                ),
            )
            .await;

        // Known fingerprints are assembled before extraction runs.
        let mut known = Vec::with_capacity(targets.len());
        for t in &targets {
            let loaded = with_timeout(
                "fingerprint load",
                self.io_timeout_secs,
                self.fingerprints.load(post_id, &t.site, date, lookback),
            )
            .await;
            known.push(loaded);
        }
        tracker.stage(20, "fingerprints loaded").await;

        let mut raw: Vec<ExtractedLink> = Vec::new();
        let total = plan.len().max(1);
        for (i, (url, extractor)) in plan.iter().enumerate() {
            let html = match with_timeout("fetch", self.io_timeout_secs, self.fetcher.fetch_html(url)).await {
                Ok(html) => html,
                Err(e) => {
                    let e = match e {
                        PipelineError::Internal(inner) => PipelineError::FetchFailure {
                            url: url.to_string(),
                            reason: format!("{inner:#}"),
                        },
                        other => other,
                    };
                    tracker.warn(format!("fetch failed: {e}")).await;
                    continue;
                }
            };
            let input = ExtractInput {
                source_url: url,
                html: &html,
                date,
                tz,
            };
            let links = match with_timeout("extract", self.io_timeout_secs, async {
                anyhow::Ok(self.registry.run(extractor.as_ref(), &input).await)
            })
            .await
            {
                Ok(v) => v,
                Err(e) => {
                    tracker.warn(format!("{url}: {e}")).await;
                    Vec::new()
                }
            };
            let progress = 20 + (40 * (i + 1) / total) as u8;
            tracker
                .stage(progress, format!("{url}: {} link(s) via {}", links.len(), extractor.name()))
                .await;
            raw.extend(links);
        }

        let mut seen = HashSet::new();
        raw.retain(|l| seen.insert(l.fingerprint()));
        tracker.state.links_found = raw.len();
        if raw.is_empty() {
            return Err(PipelineError::ExtractionFailure {
                post_id: post_id.to_string(),
            });
        }
        tracker.stage(60, format!("{} candidate link(s)", raw.len())).await;

        let mut added = 0usize;
        let mut failed = 0usize;
        let n = targets.len();
        for (i, (target, known)) in targets.iter().zip(known).enumerate() {
            let result = match known {
                Ok(known) => self.mutate(&cfg, post_id, target, date, &raw, &known).await,
                Err(e) => Err(e),
            };
            let state = match result {
                Ok(m) => m.state,
                Err(e) => {
                    failed += 1;
                    TargetState {
                        status: TargetStatus::Failed,
                        native_id: target.native_id.clone(),
                        links_added: 0,
                        sections_pruned: 0,
                        message: e.to_string(),
                    }
                }
            };
            added += state.links_added;
            let target_failed = state.status == TargetStatus::Failed;
            let line = match state.status {
                TargetStatus::Failed => format!("{}: failed: {}", target.site, state.message),
                _ => format!(
                    "{}: {} added, {} pruned",
                    target.site, state.links_added, state.sections_pruned
                ),
            };
            tracker.state.links_added = added;
            tracker.state.targets.insert(target.site.clone(), state);
            let progress = 60 + (35 * (i + 1) / n) as u8;
            if target_failed {
                tracker.warn(line).await;
                tracker.state.advance(progress);
            } else {
                tracker.stage(progress, line).await;
            }
        }

        let status = if failed == n {
            PostStatus::Failed
        } else if failed > 0 {
            PostStatus::Partial
        } else if added > 0 {
            PostStatus::Success
        } else {
            PostStatus::NoChanges
        };
        let message = match status {
            PostStatus::Failed => format!("all {n} target(s) failed"),
            PostStatus::Partial => format!("{failed} of {n} target(s) failed; {added} link(s) added"),
            PostStatus::NoChanges => "no new links".to_string(),
            _ => format!("{added} link(s) added"),
        };
        Ok((status, message))
    }

    /// dedupe -> read -> apply section -> write (if changed) -> record
    /// fingerprints of the links actually written.
    async fn mutate(
        &self,
        cfg: &SourceConfig,
        post_id: &str,
        target: &Target,
        date: NaiveDate,
        links: &[ExtractedLink],
        known: &KnownFingerprints,
    ) -> PipelineResult<Mutation> {
        let fresh = dedupe(links, known);
        counter!("linkpost_dedup_total").increment((links.len() - fresh.len()) as u64);
        if fresh.is_empty() {
            return Ok(Mutation {
                state: TargetState {
                    status: TargetStatus::NoChanges,
                    native_id: target.native_id.clone(),
                    links_added: 0,
                    sections_pruned: 0,
                    message: "all links already recorded".to_string(),
                },
                fresh: 0,
            });
        }

        let mutation_failure = |e: PipelineError| {
            counter!("linkpost_mutation_failures_total").increment(1);
            match e {
                PipelineError::Internal(inner) => PipelineError::MutationFailure {
                    site: target.site.clone(),
                    reason: format!("{inner:#}"),
                },
                other => other,
            }
        };

        let body = with_timeout(
            "document read",
            self.io_timeout_secs,
            self.documents.read_body(&target.site, &target.native_id),
        )
        .await
        .map_err(mutation_failure)?;

        let outcome = apply_section(
            &body,
            &SectionRequest {
                identity: &cfg.content_identity,
                date,
                links: &fresh,
                policy: &cfg.insertion_policy,
                retention_days: cfg.retention_days,
                heading_format: &cfg.heading_format,
            },
        );

        if outcome.changed {
            with_timeout(
                "document write",
                self.io_timeout_secs,
                self.documents.write_body(&target.site, &target.native_id, &outcome.body),
            )
            .await
            .map_err(mutation_failure)?;
        }

        if !outcome.added.is_empty() {
            let fps: Vec<Fingerprint> = outcome.added.iter().map(ExtractedLink::fingerprint).collect();
            // The write already took effect; a lost append only costs a
            // section-level URL check on the next run.
            if let Err(e) = with_timeout(
                "fingerprint append",
                self.io_timeout_secs,
                self.fingerprints.append(post_id, &target.site, date, &fps),
            )
            .await
            {
                warn!(post_id, site = %target.site, error = %e, "fingerprint append failed after write");
            }
        }
        counter!("linkpost_links_added_total").increment(outcome.links_added as u64);

        let status = if outcome.links_added > 0 {
            TargetStatus::Success
        } else {
            TargetStatus::NoChanges
        };
        Ok(Mutation {
            state: TargetState {
                status,
                native_id: target.native_id.clone(),
                links_added: outcome.links_added,
                sections_pruned: outcome.sections_pruned,
                message: if outcome.changed {
                    "document updated".to_string()
                } else {
                    "document already up to date".to_string()
                },
            },
            fresh: fresh.len(),
        })
    }

    /// Enter at the dedup stage with caller-supplied links. `date` defaults
    /// to the post's current day.
    pub async fn add_manual_links(
        &self,
        post_id: &str,
        links: &[ManualLink],
        date: Option<NaiveDate>,
        selector: &TargetSelector,
    ) -> PipelineResult<ManualAddOutcome> {
        ensure_metrics_described();
        if links.is_empty() {
            return Err(PipelineError::ValidationError("no links supplied".into()));
        }
        let cfg = self.load_config(post_id).await?;
        let date = match date {
            Some(d) => d,
            None => cfg
                .today()
                .map_err(|e| PipelineError::ValidationError(e.to_string()))?,
        };

        let mut candidates = Vec::with_capacity(links.len());
        let mut seen = HashSet::new();
        for l in links {
            let link = validate_manual(l, date)?;
            if seen.insert(link.fingerprint()) {
                candidates.push(link);
            }
        }

        let targets = resolve_targets(post_id, &cfg, selector, self.home_site.as_deref())?;
        let mut out = ManualAddOutcome::default();
        let mut last_err = None;
        for target in &targets {
            let result = async {
                let known = with_timeout(
                    "fingerprint load",
                    self.io_timeout_secs,
                    self.fingerprints.load(post_id, &target.site, date, 0),
                )
                .await?;
                self.mutate(&cfg, post_id, target, date, &candidates, &known).await
            }
            .await;
            match result {
                Ok(m) => {
                    info!(
                        post_id,
                        site = %target.site,
                        added = m.state.links_added,
                        fresh = m.fresh,
                        "manual links applied"
                    );
                    out.added += m.state.links_added;
                    out.duplicates += candidates.len() - m.state.links_added;
                    out.targets.insert(target.site.clone(), m.state);
                }
                Err(e) => {
                    warn!(post_id, site = %target.site, error = %e, "manual add failed on target");
                    out.targets.insert(
                        target.site.clone(),
                        TargetState {
                            status: TargetStatus::Failed,
                            native_id: target.native_id.clone(),
                            links_added: 0,
                            sections_pruned: 0,
                            message: e.to_string(),
                        },
                    );
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if out.targets.values().all(|t| t.status == TargetStatus::Failed) => Err(e),
            _ => Ok(out),
        }
    }
}

fn validate_manual(link: &ManualLink, date: NaiveDate) -> PipelineResult<ExtractedLink> {
    let title = link.title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        return Err(PipelineError::ValidationError(format!("link {} has no title", link.url)));
    }
    let parsed = url::Url::parse(link.url.trim())
        .map_err(|e| PipelineError::ValidationError(format!("invalid url '{}': {e}", link.url)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(PipelineError::ValidationError(format!(
            "url '{}' must be an absolute http(s) url",
            link.url
        )));
    }
    Ok(ExtractedLink::new(title, link.url.trim(), date))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn manual_links_are_validated() {
        let ok = ManualLink {
            title: "  A   title ".into(),
            url: "https://s.test/a".into(),
        };
        let link = validate_manual(&ok, d("2026-10-19")).unwrap();
        assert_eq!(link.title, "A title");
        assert_eq!(link.published_date, d("2026-10-19"));

        for (title, url) in [("", "https://s.test/a"), ("x", "not a url"), ("x", "mailto:a@b.c"), ("x", "/relative")] {
            let err = validate_manual(
                &ManualLink {
                    title: title.into(),
                    url: url.into(),
                },
                d("2026-10-19"),
            )
            .unwrap_err();
            assert_eq!(err.kind(), "validation_error");
        }
    }

    #[tokio::test]
    async fn detached_tracker_keeps_state_locally() {
        let mut t = PostTracker::detached("p", 5);
        t.start().await;
        t.stage(50, "halfway").await;
        t.finish(PostStatus::NoChanges, "nothing new").await;
        let s = t.state();
        assert_eq!(s.status, PostStatus::NoChanges);
        assert_eq!(s.progress, 100);
        assert!(s.logs.iter().any(|l| l.ends_with("halfway")));
    }
}
