// tests/common/mod.rs
//
// Shared fixtures: scripted fetchers, scripted backends and orchestrator builders.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use niche_market_analyzer::config::{HealthPolicy, OrchestratorConfig};
use niche_market_analyzer::error::{AnalysisError, ProviderError};
use niche_market_analyzer::fetch::SourceFetcher;
use niche_market_analyzer::model::{
    AnalysisRun, Capability, FetchStatus, ProgressSnapshot, ReportArtifact, RunId, SourceDocument,
};
use niche_market_analyzer::providers::backend::CompletionFuture;
use niche_market_analyzer::providers::{AiBackend, CompletionRequest, ProviderPool};
use niche_market_analyzer::store::{InMemoryStore, RunStore};
use niche_market_analyzer::Orchestrator;

/// Returns the same documents for every query (tagged with the query).
pub struct StaticFetcher {
    docs: Vec<SourceDocument>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl StaticFetcher {
    pub fn new(docs: Vec<SourceDocument>) -> Self {
        Self {
            docs,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, query: &str, max_sources: usize) -> Vec<SourceDocument> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.docs
            .iter()
            .take(max_sources)
            .cloned()
            .map(|d| d.for_query(query))
            .collect()
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

pub fn ok_doc(i: usize) -> SourceDocument {
    SourceDocument::ok(
        format!("https://source{i}.test/productivity"),
        format!("Source {i} says demand for productivity courses keeps growing among freelancers."),
    )
}

pub fn ok_docs(n: usize) -> Vec<SourceDocument> {
    (0..n).map(ok_doc).collect()
}

pub fn timed_out_doc(i: usize) -> SourceDocument {
    SourceDocument::failed(
        format!("https://slow{i}.test/"),
        FetchStatus::Timeout,
        "fetch timed out",
    )
}

/// Succeeds when the global call number (0-based) modulo `period` is below `ok_below`.
pub struct PatternBackend {
    calls: Arc<AtomicUsize>,
    period: usize,
    ok_below: usize,
}

impl PatternBackend {
    pub fn new(period: usize, ok_below: usize) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            period,
            ok_below,
        }
    }
}

impl AiBackend for PatternBackend {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % self.period < self.ok_below {
                Ok(format!("finding {n} for {}", request.capability))
            } else {
                Err(ProviderError::Unavailable("503".into()))
            }
        })
    }

    fn kind(&self) -> &'static str {
        "pattern"
    }
}

/// Answers review requests with `verdict`, everything else with a finding.
pub struct ReviewerBackend {
    verdict: &'static str,
    reviews: Arc<AtomicUsize>,
}

impl ReviewerBackend {
    pub fn new(verdict: &'static str) -> Self {
        Self {
            verdict,
            reviews: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn review_counter(&self) -> Arc<AtomicUsize> {
        self.reviews.clone()
    }
}

impl AiBackend for ReviewerBackend {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(async move {
            if request.system.contains("APPROVED or REJECTED") {
                self.reviews.fetch_add(1, Ordering::SeqCst);
                Ok(self.verdict.to_string())
            } else {
                Ok(format!("{} finding", request.capability))
            }
        })
    }

    fn kind(&self) -> &'static str {
        "reviewer"
    }
}

/// Every call announces itself on `started`, then blocks until `gate` is notified.
pub struct GatedBackend {
    pub started: Arc<Notify>,
    pub gate: Arc<Notify>,
    pub calls: Arc<AtomicUsize>,
}

impl GatedBackend {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AiBackend for GatedBackend {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.gate.notified().await;
            Ok(format!("gated {}", request.capability))
        })
    }

    fn kind(&self) -> &'static str {
        "gated"
    }
}

/// Store whose run writes start failing after `ok_writes` successful ones.
/// Artifact writes fail only when built with [`FlakyStore::failing_artifacts`].
pub struct FlakyStore {
    inner: InMemoryStore,
    ok_writes: usize,
    writes: AtomicUsize,
    fail_artifacts: bool,
}

impl FlakyStore {
    pub fn new(ok_writes: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            ok_writes,
            writes: AtomicUsize::new(0),
            fail_artifacts: false,
        }
    }

    /// Run writes always succeed; every artifact write fails.
    pub fn failing_artifacts() -> Self {
        Self {
            fail_artifacts: true,
            ..Self::new(usize::MAX)
        }
    }
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), AnalysisError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.ok_writes {
            return Err(AnalysisError::Persistence("disk full".into()));
        }
        self.inner.save_run(run).await
    }

    async fn save_artifact(&self, artifact: &ReportArtifact) -> Result<(), AnalysisError> {
        if self.fail_artifacts {
            return Err(AnalysisError::Persistence("artifact disk full".into()));
        }
        self.inner.save_artifact(artifact).await
    }

    async fn load_run(&self, id: &RunId) -> Result<Option<AnalysisRun>, AnalysisError> {
        self.inner.load_run(id).await
    }

    async fn load_artifact(&self, id: &RunId) -> Result<Option<ReportArtifact>, AnalysisError> {
        self.inner.load_artifact(id).await
    }
}

/// Small, fast config for tests: no narrative call, short timeouts.
pub fn test_config() -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::default();
    cfg.fetch_timeout_ms = 2_000;
    cfg.provider_timeout_ms = 2_000;
    cfg.ai_narrative = false;
    cfg
}

pub fn empty_pool() -> ProviderPool {
    ProviderPool::new(HealthPolicy::default())
}

/// Register `backend` for every capability.
pub fn add(pool: ProviderPool, name: &str, rank: u32, backend: impl AiBackend) -> ProviderPool {
    pool.with_provider(name, rank, &Capability::ALL, Arc::new(backend))
}

pub fn orchestrator(
    cfg: OrchestratorConfig,
    pool: ProviderPool,
    fetcher: StaticFetcher,
) -> Orchestrator {
    Orchestrator::new(cfg, pool, Arc::new(fetcher), Arc::new(InMemoryStore::new()))
}

/// Wait for the run to finish, failing the test instead of hanging.
pub async fn finish(orch: &Orchestrator, id: &RunId) -> ProgressSnapshot {
    tokio::time::timeout(Duration::from_secs(10), orch.wait(id))
        .await
        .expect("run did not finish in time")
        .expect("wait")
}

/// Drain broadcast events for `id` until its terminal snapshot.
pub async fn collect_events(
    rx: &mut broadcast::Receiver<ProgressSnapshot>,
    id: RunId,
) -> Vec<ProgressSnapshot> {
    let mut out = Vec::new();
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no terminal event in time")
            .expect("broadcast closed");
        if ev.run_id != id {
            continue;
        }
        let done = ev.is_terminal();
        out.push(ev);
        if done {
            return out;
        }
    }
}
