// src/fetch/mod.rs
//! Source Fetcher boundary: the narrow capability the collect stage calls.
//!
//! Contract: `fetch` never fails as a whole. Each returned document carries its
//! own status, so one dead source never hides the others.

pub mod http;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashSet;

use crate::model::{InputSpec, SourceDocument};

pub use http::HttpFetcher;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Up to `max_sources` documents for `query`, each with its own fetch status.
    async fn fetch(&self, query: &str, max_sources: usize) -> Vec<SourceDocument>;
    fn name(&self) -> &'static str;
}

/// Angles appended to the niche, in order of usefulness.
const QUERY_ANGLES: [&str; 8] = [
    "",
    "market trends",
    "competitors",
    "customer reviews",
    "pricing",
    "audience pain points",
    "growth opportunities",
    "industry news",
];

/// Search queries for a run. The depth tier only changes how many.
pub fn build_queries(input: &InputSpec, count: usize) -> Vec<String> {
    QUERY_ANGLES
        .iter()
        .take(count.clamp(1, QUERY_ANGLES.len()))
        .map(|angle| {
            if angle.is_empty() {
                input.niche.clone()
            } else {
                format!("{} {}", input.niche, angle)
            }
        })
        .collect()
}

/// Normalize page text: decode entities, strip tags/scripts, collapse whitespace, cap length.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    static RE_SCRIPTS: OnceCell<Regex> = OnceCell::new();
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();

    // 1) Drop script/style bodies entirely
    let re_scripts = RE_SCRIPTS.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
            .expect("static regex")
    });
    let mut out = re_scripts.replace_all(s, " ").to_string();

    // 2) Strip remaining tags
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) HTML entity decode (after tag strip so decoded '<' is kept as text)
    out = html_escape::decode_html_entities(&out).to_string();

    // 4) Normalize typographic quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 5) Collapse whitespace
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 6) Length cap
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }
    out
}

/// Drop documents whose URL was already seen (first wins). Returns (kept, dropped).
pub fn dedup_by_url(docs: Vec<SourceDocument>) -> (Vec<SourceDocument>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(docs.len());
    let mut dropped = 0usize;
    for d in docs {
        let key = d.url.trim().trim_end_matches('/').to_ascii_lowercase();
        if !key.is_empty() && !seen.insert(key) {
            dropped += 1;
            continue;
        }
        kept.push(d);
    }
    (kept, dropped)
}
