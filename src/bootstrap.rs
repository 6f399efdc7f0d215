// src/bootstrap.rs
//! Wire an [`Orchestrator`] from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::{OrchestratorConfig, ProviderSpec};
use crate::fetch::HttpFetcher;
use crate::orchestrator::Orchestrator;
use crate::providers::ProviderPool;
use crate::source_weights::SourceWeightsConfig;
use crate::store::{InMemoryStore, JsonFileStore, RunStore};

pub const ENV_SOURCE_WEIGHTS_PATH: &str = "SOURCE_WEIGHTS_PATH";
pub const DEFAULT_SOURCE_WEIGHTS_PATH: &str = "config/source_weights.json";
pub const MOCK_FALLBACK_NOTE: &str =
    "no AI provider is enabled: findings are placeholders from the local mock backend";

/// Pool, fetcher, store and source weights from `cfg`.
///
/// With no enabled provider the pool falls back to a single local mock, so a
/// fresh checkout still completes runs; every report then carries
/// [`MOCK_FALLBACK_NOTE`].
pub fn build_orchestrator(cfg: OrchestratorConfig) -> anyhow::Result<Orchestrator> {
    // Safe diagnostics: only names, kinds and key presence.
    for p in &cfg.providers {
        info!(
            target: "orchestrator",
            provider = %p.name,
            rank = p.rank,
            kind = ?p.kind,
            enabled = p.enabled,
            keys = p.resolve_api_keys().len(),
            "provider configured"
        );
    }

    let mut specs = cfg.providers.clone();
    let fallback = !specs.iter().any(|p| p.enabled);
    if fallback {
        warn!(target: "orchestrator", "no enabled providers, using local mock");
        specs.push(ProviderSpec::mock("mock", 1));
    }
    let pool = ProviderPool::from_specs(&specs, cfg.health).context("building provider pool")?;

    if cfg.sources.url_templates.is_empty() {
        warn!(target: "orchestrator", "no source url templates configured; runs will end with no_data");
    }
    let fetcher = HttpFetcher::new(
        &cfg.sources,
        cfg.fetch_timeout(),
        cfg.max_document_chars,
        cfg.fetch_concurrency,
    )
    .context("building source fetcher")?;

    let store: Arc<dyn RunStore> = match &cfg.store_dir {
        Some(dir) => {
            info!(target: "store", dir = %dir.display(), "json file store");
            Arc::new(JsonFileStore::new(dir.clone()))
        }
        None => {
            info!(target: "store", "in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let weights_path = std::env::var(ENV_SOURCE_WEIGHTS_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOURCE_WEIGHTS_PATH));
    let weights = SourceWeightsConfig::load_from_file(&weights_path);

    let orchestrator =
        Orchestrator::new(cfg, pool, Arc::new(fetcher), store).with_source_weights(weights);
    Ok(if fallback {
        orchestrator.with_report_note(MOCK_FALLBACK_NOTE)
    } else {
        orchestrator
    })
}
