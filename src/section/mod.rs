//! # Section manager
//! Idempotent insert/replace/prune of the dated link section inside a target
//! document body.
//!
//! A section is a `linkpost/section` block whose attributes carry the owning
//! content identity and the date. Sections are found by that structural
//! marker, never by styling. Older bodies may still hold the legacy format
//! (a `core/group` with class `linkpost-daily-links` and anchor
//! `links-YYYY-MM-DD`); those are migrated without losing links.

pub mod blocks;

use chrono::format::{Item, StrftimeItems};
use chrono::{Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;

use crate::extract::clean_text;
use crate::model::{ExtractedLink, InsertionPolicy, DEFAULT_HEADING_FORMAT};
use blocks::{Block, BlockDocument, Node};

pub const SECTION_BLOCK: &str = "linkpost/section";
pub const LEGACY_CLASS: &str = "linkpost-daily-links";
pub const LEGACY_ANCHOR_PREFIX: &str = "links-";

static RE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*"([^"]*)"[^>]*>(.*?)</a>"#).expect("link regex")
});

/// Inputs for one mutation of one document.
#[derive(Debug, Clone)]
pub struct SectionRequest<'a> {
    pub identity: &'a str,
    pub date: NaiveDate,
    pub links: &'a [ExtractedLink],
    pub policy: &'a InsertionPolicy,
    /// `0` keeps every section.
    pub retention_days: u32,
    pub heading_format: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionOutcome {
    pub links_added: usize,
    pub sections_pruned: usize,
    /// The links actually written; only these get fingerprinted.
    pub added: Vec<ExtractedLink>,
    /// False when the body needs no write at all.
    pub changed: bool,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Current,
    Legacy,
}

#[derive(Debug, Clone)]
struct Found {
    kind: Kind,
    date: NaiveDate,
    links: Vec<ExtractedLink>,
}

enum Action {
    Keep,
    Drop,
    Replace(Block),
}

/// Current-format section of `identity`, or a legacy section; `None` otherwise.
fn classify(b: &Block, identity: &str) -> Option<(Kind, NaiveDate)> {
    if b.is(SECTION_BLOCK) {
        let owner_ok = b.attr_str("post").map_or(true, |p| p == identity);
        let date = b
            .attr_str("date")
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())?;
        return owner_ok.then_some((Kind::Current, date));
    }
    if b.is("group") && b.has_class(LEGACY_CLASS) {
        let date = b
            .attr_str("anchor")
            .and_then(|a| a.strip_prefix(LEGACY_ANCHOR_PREFIX))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())?;
        return Some((Kind::Legacy, date));
    }
    None
}

/// Links rendered inside a section, dated with the section's date.
fn parse_links(b: &Block, date: NaiveDate) -> Vec<ExtractedLink> {
    let html = b.inner_html();
    RE_LINK
        .captures_iter(&html)
        .filter_map(|c| {
            let url = html_escape::decode_html_entities(c[1].trim()).to_string();
            if url.is_empty() {
                return None;
            }
            let title = clean_text(&c[2]);
            Some(ExtractedLink::new(title, url, date))
        })
        .collect()
}

fn collect(nodes: &[Node], identity: &str, out: &mut Vec<Found>) {
    for n in nodes {
        if let Node::Block(b) = n {
            match classify(b, identity) {
                Some((kind, date)) => out.push(Found {
                    kind,
                    date,
                    links: parse_links(b, date),
                }),
                None => collect(&b.inner, identity, out),
            }
        }
    }
}

/// Apply `actions` in the same traversal order `collect` used.
fn rewrite(nodes: Vec<Node>, identity: &str, actions: &mut std::vec::IntoIter<Action>) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for n in nodes {
        match n {
            Node::Block(mut b) => {
                if classify(&b, identity).is_some() {
                    match actions.next().unwrap_or(Action::Keep) {
                        Action::Keep => out.push(Node::Block(b)),
                        Action::Drop => {}
                        Action::Replace(nb) => out.push(Node::Block(nb)),
                    }
                } else {
                    b.inner = rewrite(std::mem::take(&mut b.inner), identity, actions);
                    out.push(Node::Block(b));
                }
            }
            html => out.push(html),
        }
    }
    out
}

fn heading_label(date: NaiveDate, format: &str) -> String {
    let valid = !format.trim().is_empty()
        && StrftimeItems::new(format).all(|i| !matches!(i, Item::Error));
    let f = if valid { format } else { DEFAULT_HEADING_FORMAT };
    date.format(f).to_string()
}

/// Canonical markup for one section.
pub fn render_section(identity: &str, date: NaiveDate, links: &[ExtractedLink], heading_format: &str) -> Block {
    let label = html_escape::encode_text(&heading_label(date, heading_format)).to_string();
    let mut items = String::new();
    for l in links {
        items.push_str(&format!(
            "<!-- wp:list-item -->\n<li><a href=\"{}\">{}</a></li>\n<!-- /wp:list-item -->",
            html_escape::encode_double_quoted_attribute(&l.url),
            html_escape::encode_text(&l.title)
        ));
    }
    let inner = format!(
        "\n<div class=\"wp-block-linkpost-section\">\
<!-- wp:heading {{\"level\":3}} -->\n<h3 class=\"wp-block-heading\">{label}</h3>\n<!-- /wp:heading -->\n\n\
<!-- wp:list -->\n<ul class=\"wp-block-list\">{items}</ul>\n<!-- /wp:list --></div>\n"
    );
    Block::new(
        SECTION_BLOCK,
        Some(json!({ "post": identity, "date": date.format("%Y-%m-%d").to_string() })),
        vec![Node::Html(inner)],
    )
}

fn heading_matches(b: &Block, policy: &InsertionPolicy) -> bool {
    match policy {
        InsertionPolicy::Prepend => false,
        InsertionPolicy::AfterHeadingId(id) => b.anchor().is_some_and(|a| a == id.trim()),
        InsertionPolicy::AfterHeadingText(text) => {
            let needle = text.trim().to_lowercase();
            !needle.is_empty() && b.text().to_lowercase().contains(&needle)
        }
    }
}

/// Put `section` right after the first heading the policy names, searching
/// nested blocks in document order; the section lands in that heading's
/// parent. Returns false when no heading matches.
fn insert_after_heading(nodes: &mut Vec<Node>, policy: &InsertionPolicy, section: &Block) -> bool {
    for i in 0..nodes.len() {
        let Node::Block(b) = &mut nodes[i] else {
            continue;
        };
        if b.is("heading") {
            if heading_matches(b, policy) {
                nodes.insert(i + 1, Node::Html("\n\n".to_string()));
                nodes.insert(i + 2, Node::Block(section.clone()));
                return true;
            }
        } else if !b.is(SECTION_BLOCK)
            && !(b.is("group") && b.has_class(LEGACY_CLASS))
            && insert_after_heading(&mut b.inner, policy, section)
        {
            return true;
        }
    }
    false
}

/// Insert, replace or prune the section for `req.date` in `document`.
pub fn apply_section(document: &str, req: &SectionRequest<'_>) -> SectionOutcome {
    let doc = BlockDocument::parse(document);

    let mut found = Vec::new();
    collect(&doc.nodes, req.identity, &mut found);

    // An out-of-range window keeps everything, like `0`.
    let cutoff = (req.retention_days > 0)
        .then(|| req.date.checked_sub_signed(Duration::days(i64::from(req.retention_days))))
        .flatten();
    let expired = |d: NaiveDate| cutoff.is_some_and(|c| d < c);

    // Existing links for the target date, across every matching section.
    let mut merged: Vec<ExtractedLink> = Vec::new();
    let mut urls: HashSet<String> = HashSet::new();
    for f in found.iter().filter(|f| f.date == req.date) {
        for l in &f.links {
            if urls.insert(l.url.clone()) {
                merged.push(l.clone());
            }
        }
    }
    let mut added = Vec::new();
    for l in req.links {
        if urls.insert(l.url.clone()) {
            added.push(l.clone());
        }
    }

    let target_count = found.iter().filter(|f| f.date == req.date).count();
    let target_clean = target_count == 1
        && found
            .iter()
            .any(|f| f.date == req.date && f.kind == Kind::Current);
    // Replacement goes where the first current-format section sits, else
    // where the first legacy one sits.
    let host = found
        .iter()
        .position(|f| f.date == req.date && f.kind == Kind::Current)
        .or_else(|| found.iter().position(|f| f.date == req.date));

    let mut pruned = 0usize;
    let mut changed = false;
    let mut actions = Vec::with_capacity(found.len());
    for (i, f) in found.iter().enumerate() {
        if f.date == req.date {
            if Some(i) != host {
                changed = true;
                actions.push(Action::Drop);
            } else if target_clean && added.is_empty() {
                actions.push(Action::Keep);
            } else {
                changed = true;
                let mut all = merged.clone();
                all.extend(added.iter().cloned());
                actions.push(Action::Replace(render_section(
                    req.identity,
                    req.date,
                    &all,
                    req.heading_format,
                )));
            }
        } else if expired(f.date) {
            pruned += 1;
            changed = true;
            actions.push(Action::Drop);
        } else if f.kind == Kind::Legacy {
            changed = true;
            actions.push(Action::Replace(render_section(
                req.identity,
                f.date,
                &f.links,
                req.heading_format,
            )));
        } else {
            actions.push(Action::Keep);
        }
    }

    let mut nodes = rewrite(doc.nodes, req.identity, &mut actions.into_iter());

    if host.is_none() && !added.is_empty() {
        changed = true;
        let section = render_section(req.identity, req.date, &added, req.heading_format);
        if !insert_after_heading(&mut nodes, req.policy, &section) {
            nodes.insert(0, Node::Block(section));
            if nodes.len() > 1 {
                nodes.insert(1, Node::Html("\n\n".to_string()));
            }
        }
    }

    let body = if changed {
        BlockDocument { nodes }.render()
    } else {
        document.to_string()
    };
    SectionOutcome {
        links_added: added.len(),
        sections_pruned: pruned,
        added,
        changed,
        body,
    }
}

/// All links currently present in `identity`'s section for `date`.
pub fn links_in_section(document: &str, identity: &str, date: NaiveDate) -> Vec<ExtractedLink> {
    let doc = BlockDocument::parse(document);
    let mut found = Vec::new();
    collect(&doc.nodes, identity, &mut found);
    found
        .into_iter()
        .filter(|f| f.date == date)
        .flat_map(|f| f.links)
        .collect()
}

/// Dates of every section `identity` owns in `document`, in document order.
pub fn section_dates(document: &str, identity: &str) -> Vec<NaiveDate> {
    let doc = BlockDocument::parse(document);
    let mut found = Vec::new();
    collect(&doc.nodes, identity, &mut found);
    found.into_iter().map(|f| f.date).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn link(n: &str, day: &str) -> ExtractedLink {
        ExtractedLink::new(format!("Link {n}"), format!("https://s.test/{n}"), d(day))
    }

    fn req<'a>(links: &'a [ExtractedLink], policy: &'a InsertionPolicy, day: &str) -> SectionRequest<'a> {
        SectionRequest {
            identity: "spins",
            date: d(day),
            links,
            policy,
            retention_days: 7,
            heading_format: DEFAULT_HEADING_FORMAT,
        }
    }

    const BODY: &str = "<!-- wp:paragraph -->\n<p>Intro</p>\n<!-- /wp:paragraph -->\n\n\
<!-- wp:heading {\"anchor\":\"links\"} -->\n<h2 class=\"wp-block-heading\" id=\"links\">Today's Links</h2>\n<!-- /wp:heading -->\n\n\
<!-- wp:paragraph -->\n<p>Outro</p>\n<!-- /wp:paragraph -->";

    #[test]
    fn creates_then_is_idempotent() {
        let policy = InsertionPolicy::Prepend;
        let links = vec![link("a", "2026-10-19"), link("b", "2026-10-19")];
        let first = apply_section(BODY, &req(&links, &policy, "2026-10-19"));
        assert_eq!(first.links_added, 2);
        assert!(first.changed);
        assert!(first.body.starts_with("<!-- wp:linkpost/section {"));
        assert!(first.body.ends_with(BODY));

        let second = apply_section(&first.body, &req(&links, &policy, "2026-10-19"));
        assert_eq!(second.links_added, 0);
        assert!(!second.changed);
        assert_eq!(second.body, first.body);
    }

    #[test]
    fn replacement_keeps_existing_and_appends_new() {
        let policy = InsertionPolicy::Prepend;
        let first = apply_section(BODY, &req(&[link("a", "2026-10-19")], &policy, "2026-10-19"));
        let second = apply_section(
            &first.body,
            &req(&[link("a", "2026-10-19"), link("c", "2026-10-19")], &policy, "2026-10-19"),
        );
        assert_eq!(second.links_added, 1);
        assert_eq!(second.added[0].url, "https://s.test/c");
        let now: Vec<_> = links_in_section(&second.body, "spins", d("2026-10-19"))
            .into_iter()
            .map(|l| l.url)
            .collect();
        assert_eq!(now, vec!["https://s.test/a", "https://s.test/c"]);
        assert_eq!(section_dates(&second.body, "spins").len(), 1);
    }

    #[test]
    fn after_heading_policies_and_missing_heading_fallback() {
        let links = vec![link("a", "2026-10-19")];
        let by_id = InsertionPolicy::AfterHeadingId("links".into());
        let out = apply_section(BODY, &req(&links, &by_id, "2026-10-19"));
        let heading_at = out.body.find("Today's Links").unwrap();
        let section_at = out.body.find("wp:linkpost/section").unwrap();
        let outro_at = out.body.find("Outro").unwrap();
        assert!(heading_at < section_at && section_at < outro_at);

        let by_text = InsertionPolicy::AfterHeadingText("today's".into());
        let out2 = apply_section(BODY, &req(&links, &by_text, "2026-10-19"));
        assert_eq!(out2.body, out.body);

        let missing = InsertionPolicy::AfterHeadingId("missing".into());
        let prepend = InsertionPolicy::Prepend;
        let a = apply_section(BODY, &req(&links, &missing, "2026-10-19"));
        let b = apply_section(BODY, &req(&links, &prepend, "2026-10-19"));
        assert_eq!(a.body, b.body);
    }

    #[test]
    fn heading_nested_in_a_group_is_found() {
        let body = "<!-- wp:paragraph -->\n<p>Intro</p>\n<!-- /wp:paragraph -->\n\n\
<!-- wp:group {\"layout\":{\"type\":\"constrained\"}} -->\n<div class=\"wp-block-group\">\
<!-- wp:heading {\"anchor\":\"links\"} -->\n<h2 class=\"wp-block-heading\" id=\"links\">Today's Links</h2>\n<!-- /wp:heading -->\n\n\
<!-- wp:paragraph -->\n<p>Inside</p>\n<!-- /wp:paragraph --></div>\n<!-- /wp:group -->\n\n\
<!-- wp:paragraph -->\n<p>Outro</p>\n<!-- /wp:paragraph -->";
        let links = vec![link("a", "2026-10-19")];
        for policy in [
            InsertionPolicy::AfterHeadingId("links".into()),
            InsertionPolicy::AfterHeadingText("today's links".into()),
        ] {
            let out = apply_section(body, &req(&links, &policy, "2026-10-19"));
            let heading_at = out.body.find("Today's Links").unwrap();
            let section_at = out.body.find("wp:linkpost/section").unwrap();
            let inside_at = out.body.find("Inside").unwrap();
            let group_end = out.body.find("<!-- /wp:group -->").unwrap();
            assert!(heading_at < section_at, "{policy:?}: section before heading");
            assert!(section_at < inside_at && inside_at < group_end, "{policy:?}: not in the group");

            let again = apply_section(&out.body, &req(&links, &policy, "2026-10-19"));
            assert!(!again.changed);
        }
    }

    #[test]
    fn huge_retention_disables_pruning() {
        let policy = InsertionPolicy::Prepend;
        let old = apply_section(BODY, &req(&[link("o", "2026-10-01")], &policy, "2026-10-01"));
        let new_links = [link("n", "2026-10-19")];
        let mut r = req(&new_links, &policy, "2026-10-19");
        r.retention_days = u32::MAX;
        let out = apply_section(&old.body, &r);
        assert_eq!(out.sections_pruned, 0);
        assert_eq!(section_dates(&out.body, "spins").len(), 2);
    }

    #[test]
    fn sections_beyond_retention_are_pruned() {
        let policy = InsertionPolicy::Prepend;
        let mut body = BODY.to_string();
        for day in ["2026-10-01", "2026-10-12", "2026-10-11"] {
            body = apply_section(&body, &req(&[link(day, day)], &policy, day)).body;
        }
        let out = apply_section(&body, &req(&[link("z", "2026-10-19")], &policy, "2026-10-19"));
        assert_eq!(out.sections_pruned, 2);
        let dates = section_dates(&out.body, "spins");
        assert_eq!(dates, vec![d("2026-10-19"), d("2026-10-12")]);
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let policy = InsertionPolicy::Prepend;
        let old = apply_section(BODY, &req(&[link("o", "2020-01-01")], &policy, "2020-01-01")).body;
        let mut r = req(&[], &policy, "2026-10-19");
        r.retention_days = 0;
        let out = apply_section(&old, &r);
        assert_eq!(out.sections_pruned, 0);
        assert!(!out.changed);
    }

    #[test]
    fn legacy_section_is_merged_into_replacement() {
        let legacy = "<!-- wp:group {\"className\":\"linkpost-daily-links\",\"anchor\":\"links-2026-10-19\"} -->\n\
<div class=\"wp-block-group linkpost-daily-links\" id=\"links-2026-10-19\"><h3>October 19</h3>\
<ul><li><a href=\"https://s.test/old\">Old &amp; kept</a></li></ul></div>\n<!-- /wp:group -->\n\n";
        let body = format!("{legacy}{BODY}");
        let policy = InsertionPolicy::Prepend;
        let out = apply_section(&body, &req(&[link("new", "2026-10-19")], &policy, "2026-10-19"));
        assert_eq!(out.links_added, 1);
        assert!(!out.body.contains(LEGACY_CLASS));
        let links = links_in_section(&out.body, "spins", d("2026-10-19"));
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].title, "Old & kept");
        assert_eq!(links[1].url, "https://s.test/new");
    }

    #[test]
    fn duplicate_sections_for_one_date_collapse() {
        let policy = InsertionPolicy::Prepend;
        let one = apply_section(BODY, &req(&[link("a", "2026-10-19")], &policy, "2026-10-19")).body;
        let two = apply_section(&one, &req(&[link("b", "2026-10-19")], &policy, "2026-10-19")).body;
        // Simulate an editor duplicating the block.
        let section = render_section("spins", d("2026-10-19"), &[link("x", "2026-10-19")], DEFAULT_HEADING_FORMAT);
        let doubled = format!("{}\n\n{}", BlockDocument { nodes: vec![Node::Block(section)] }.render(), two);
        let out = apply_section(&doubled, &req(&[], &policy, "2026-10-19"));
        assert!(out.changed);
        assert_eq!(section_dates(&out.body, "spins").len(), 1);
        assert_eq!(links_in_section(&out.body, "spins", d("2026-10-19")).len(), 3);
    }

    #[test]
    fn other_posts_sections_are_untouched() {
        let policy = InsertionPolicy::Prepend;
        let theirs = render_section("other", d("2020-01-01"), &[link("t", "2020-01-01")], DEFAULT_HEADING_FORMAT);
        let body = format!("{}\n\n{BODY}", BlockDocument { nodes: vec![Node::Block(theirs)] }.render());
        let out = apply_section(&body, &req(&[link("a", "2026-10-19")], &policy, "2026-10-19"));
        assert_eq!(out.sections_pruned, 0);
        assert_eq!(section_dates(&out.body, "other"), vec![d("2020-01-01")]);
    }

    #[test]
    fn titles_and_urls_are_escaped() {
        let l = ExtractedLink::new("<b>Bold</b> & co", "https://s.test/?a=1&b=\"2\"", d("2026-10-19"));
        let b = render_section("spins", d("2026-10-19"), &[l.clone()], "%Q bogus");
        let html = b.inner_html();
        assert!(html.contains("&lt;b&gt;Bold&lt;/b&gt; &amp; co"));
        assert!(html.contains("October 19, 2026"));
        let back = parse_links(&b, d("2026-10-19"));
        assert_eq!(back[0].url, l.url);
    }
}
