// src/config/orchestrator.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::providers::ProviderSpec;
use crate::model::DepthTier;

pub const ENV_CONFIG_PATH: &str = "ORCHESTRATOR_CONFIG_PATH";

fn default_fetch_concurrency() -> usize {
    4
}
fn default_worker_pool_size() -> usize {
    4
}
fn default_fetch_timeout_ms() -> u64 {
    20_000
}
fn default_provider_timeout_ms() -> u64 {
    60_000
}
fn default_min_success_ratio() -> f64 {
    0.5
}
fn default_chunk_chars() -> usize {
    4_000
}
fn default_max_document_chars() -> usize {
    20_000
}
fn default_ai_narrative() -> bool {
    true
}
fn default_retention_secs() -> u64 {
    3_600
}

/// Fan-out limits for one depth tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthProfile {
    /// Number of search queries derived from the niche.
    pub queries: usize,
    /// Max sources requested per query.
    pub max_sources: usize,
    /// Max chunks dispatched to providers for the whole run.
    pub max_chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthProfiles {
    pub low: DepthProfile,
    pub medium: DepthProfile,
    pub high: DepthProfile,
}

impl Default for DepthProfiles {
    fn default() -> Self {
        Self {
            low: DepthProfile {
                queries: 1,
                max_sources: 3,
                max_chunks: 8,
            },
            medium: DepthProfile {
                queries: 3,
                max_sources: 6,
                max_chunks: 24,
            },
            high: DepthProfile {
                queries: 5,
                max_sources: 10,
                max_chunks: 60,
            },
        }
    }
}

/// Provider health policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Consecutive transient failures before suspension.
    pub failure_threshold: u32,
    /// First suspension length; doubles per further suspension.
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Cool-down after a rate-limit response.
    pub rate_limit_cooldown_ms: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff_ms: 30_000,
            max_backoff_ms: 15 * 60_000,
            rate_limit_cooldown_ms: 5_000,
        }
    }
}

impl HealthPolicy {
    /// Suspension length for the n-th consecutive suspension (1-based).
    pub fn backoff_for(&self, suspensions: u32) -> Duration {
        let exp = suspensions.saturating_sub(1).min(20);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Where the HTTP fetcher looks for content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// URL templates with a `{query}` placeholder, one per source.
    #[serde(default)]
    pub url_templates: Vec<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    /// Minimum succeeded/total chunk ratio to enter synthesis.
    #[serde(default = "default_min_success_ratio")]
    pub min_success_ratio: f64,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,
    /// Ask the pool to write the merged narrative (falls back to a local merge).
    #[serde(default = "default_ai_narrative")]
    pub ai_narrative: bool,
    /// Run the verification pass over the finished report.
    #[serde(default)]
    pub verify_report: bool,
    /// How long finished runs stay queryable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default)]
    pub depth: DepthProfiles,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
    #[serde(default)]
    pub sources: SourcesConfig,
    /// Directory for the JSON run store; in-memory store when absent.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            worker_pool_size: default_worker_pool_size(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            provider_timeout_ms: default_provider_timeout_ms(),
            min_success_ratio: default_min_success_ratio(),
            chunk_chars: default_chunk_chars(),
            max_document_chars: default_max_document_chars(),
            ai_narrative: default_ai_narrative(),
            verify_report: false,
            retention_secs: default_retention_secs(),
            depth: DepthProfiles::default(),
            health: HealthPolicy::default(),
            providers: Vec::new(),
            sources: SourcesConfig::default(),
            store_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn profile(&self, depth: DepthTier) -> DepthProfile {
        match depth {
            DepthTier::Low => self.depth.low,
            DepthTier::Medium => self.depth.medium,
            DepthTier::High => self.depth.high,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Clamp out-of-range values back to something usable.
    pub fn sanitize(mut self) -> Self {
        self.fetch_concurrency = self.fetch_concurrency.max(1);
        self.worker_pool_size = self.worker_pool_size.max(1);
        if self.fetch_timeout_ms == 0 {
            self.fetch_timeout_ms = default_fetch_timeout_ms();
        }
        if self.provider_timeout_ms == 0 {
            self.provider_timeout_ms = default_provider_timeout_ms();
        }
        if !(0.0..=1.0).contains(&self.min_success_ratio) || self.min_success_ratio.is_nan() {
            self.min_success_ratio = default_min_success_ratio();
        }
        self.chunk_chars = self.chunk_chars.max(200);
        self.max_document_chars = self.max_document_chars.max(self.chunk_chars);
        for p in [&mut self.depth.low, &mut self.depth.medium, &mut self.depth.high] {
            p.queries = p.queries.max(1);
            p.max_sources = p.max_sources.max(1);
            p.max_chunks = p.max_chunks.max(1);
        }
        self.health.failure_threshold = self.health.failure_threshold.max(1);
        if self.health.max_backoff_ms < self.health.base_backoff_ms {
            std::mem::swap(
                &mut self.health.max_backoff_ms,
                &mut self.health.base_backoff_ms,
            );
        }
        for p in self.providers.iter_mut() {
            p.sanitize();
        }
        self.providers.retain(|p| !p.name.is_empty());
        self
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<OrchestratorConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg: OrchestratorConfig = match ext.as_str() {
        "json" => serde_json::from_str(&content).context("parsing config json")?,
        _ => toml::from_str(&content).context("parsing config toml")?,
    };
    Ok(cfg.sanitize())
}

/// Load config using env var + fallbacks:
/// 1) $ORCHESTRATOR_CONFIG_PATH
/// 2) config/orchestrator.toml
/// 3) config/orchestrator.json
/// 4) built-in defaults
pub fn load_config_default() -> Result<OrchestratorConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        } else {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/orchestrator.toml");
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/orchestrator.json");
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    Ok(OrchestratorConfig::default())
}
