//! # Source Weights
//!
//! Maps a source URL to a reliability weight in `[0.0, 1.0]`.
//!
//! - Loads from JSON config (domain weights + pattern weights).
//! - Case-insensitive host lookup; `www.` and ports are ignored.
//! - Fallback order: exact host → parent domain → pattern match → default.
//! - Includes a built-in `default_seed()` with common reference domains.
//!
//! The collect stage uses the weight to decide which documents survive the chunk
//! budget; the report lists every cited source with its weight.

use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path};

/// Configuration for source weights, loaded from JSON or defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceWeightsConfig {
    /// Weight if nothing matches.
    #[serde(default = "default_default_weight")]
    pub default_weight: f32,
    /// Weight for a host with no usable domain (opaque handles, file paths).
    #[serde(default = "default_unknown_weight")]
    pub unknown_weight: f32,
    /// Explicit weights for domains (suffix match on label boundaries).
    #[serde(default)]
    pub domains: HashMap<String, f32>,
    /// Substring patterns checked in order after domains.
    #[serde(default)]
    pub patterns: Vec<(String, f32)>,
}

fn default_default_weight() -> f32 {
    0.50
}

fn default_unknown_weight() -> f32 {
    0.30
}

/// Thresholds for the human-readable confidence label.
const HIGH: f32 = 0.80;
const MEDIUM: f32 = 0.50;

impl SourceWeightsConfig {
    /// Load configuration from a JSON file.
    /// Falls back to `default_seed()` on error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|_| Self::default_seed()),
            Err(_) => Self::default_seed(),
        }
    }

    /// Reliability weight for a document URL.
    ///
    /// Steps:
    /// 1. Exact host match.
    /// 2. Parent-domain match (`news.bbc.co.uk` → `bbc.co.uk`).
    /// 3. Pattern fallback (`.gov`, `blog`, ...).
    /// 4. Default weight.
    pub fn weight_for(&self, url: &str) -> f32 {
        let Some(host) = host_of(url) else {
            return clamp01(self.unknown_weight);
        };

        // 1) + 2) Walk up the labels.
        let mut candidate = host.as_str();
        loop {
            if let Some(&w) = self.domains.get(candidate) {
                return clamp01(w);
            }
            match candidate.find('.') {
                Some(dot) if candidate[dot + 1..].contains('.') => candidate = &candidate[dot + 1..],
                _ => break,
            }
        }

        // 3) Patterns.
        for (pat, w) in &self.patterns {
            if host.contains(pat.as_str()) {
                return clamp01(*w);
            }
        }

        // 4) Default.
        clamp01(self.default_weight)
    }

    /// "high" | "medium" | "low".
    pub fn confidence_label(weight: f32) -> &'static str {
        if weight >= HIGH {
            "high"
        } else if weight >= MEDIUM {
            "medium"
        } else {
            "low"
        }
    }

    /// Built-in seed with common reference, news and social domains.
    pub fn default_seed() -> Self {
        let mut domains = HashMap::new();
        for (k, v) in [
            ("reuters.com", 0.90),
            ("bloomberg.com", 0.90),
            ("ft.com", 0.88),
            ("wsj.com", 0.88),
            ("forbes.com", 0.80),
            ("statista.com", 0.85),
            ("harvard.edu", 0.95),
            ("mit.edu", 0.95),
            ("ibge.gov.br", 0.95),
            ("sebrae.com.br", 0.85),
            ("g1.globo.com", 0.75),
            ("wikipedia.org", 0.60),
            ("linkedin.com", 0.50),
            ("reddit.com", 0.45),
            ("medium.com", 0.40),
        ] {
            domains.insert(k.to_string(), v);
        }

        let patterns = [
            (".gov", 0.85),
            (".edu", 0.85),
            (".org", 0.70),
            ("news", 0.70),
            ("blogspot", 0.30),
            ("wordpress", 0.30),
            ("blog", 0.30),
        ]
        .into_iter()
        .map(|(p, w)| (p.to_string(), w))
        .collect();

        Self {
            default_weight: default_default_weight(),
            unknown_weight: default_unknown_weight(),
            domains,
            patterns,
        }
    }
}

impl Default for SourceWeightsConfig {
    fn default() -> Self {
        Self::default_seed()
    }
}

/// Lower-cased host without `www.`; `None` for anything that is not a URL with a host.
fn host_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Clamp to [0.0, 1.0].
fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}
