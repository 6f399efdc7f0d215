// src/orchestrator.rs
//! # Analysis Orchestrator
//! Public entry point: start runs, observe them, cancel them, fetch their reports.
//!
//! `start` validates and persists the run, then spawns the pipeline on its own
//! tokio task and returns at once. Observation goes through the progress tracker
//! (polling, per-run `watch`, or the process-wide broadcast).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::error::AnalysisError;
use crate::fetch::SourceFetcher;
use crate::metrics::ensure_metrics_described;
use crate::model::{AnalysisRun, InputSpec, ProgressSnapshot, ReportArtifact, RunId};
use crate::pipeline::{self, RunContext};
use crate::progress::ProgressTracker;
use crate::providers::ProviderPool;
use crate::source_weights::SourceWeightsConfig;
use crate::store::RunStore;

struct RunHandle {
    cancel: Arc<AtomicBool>,
}

pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    pool: Arc<ProviderPool>,
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn RunStore>,
    weights: Arc<SourceWeightsConfig>,
    report_notes: Arc<Vec<String>>,
    tracker: Arc<ProgressTracker>,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        pool: ProviderPool,
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        ensure_metrics_described();
        let tracker = Arc::new(ProgressTracker::new(config.retention()));
        Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
            fetcher,
            store,
            weights: Arc::new(SourceWeightsConfig::default_seed()),
            report_notes: Arc::new(Vec::new()),
            tracker,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source_weights(mut self, weights: SourceWeightsConfig) -> Self {
        self.weights = Arc::new(weights);
        self
    }

    /// A note every report of this orchestrator carries first.
    pub fn with_report_note(mut self, note: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.report_notes).push(note.into());
        self
    }

    pub fn report_notes(&self) -> &[String] {
        &self.report_notes
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Validate, persist in `pending`, and launch the pipeline.
    pub async fn start(&self, input: InputSpec) -> Result<RunId, AnalysisError> {
        let input = input.validated()?;
        self.prune();

        let run = AnalysisRun::new(input);
        let id = run.id;
        self.store.save_run(&run).await?;

        let progress = self.tracker.register(id);
        let cancel = Arc::new(AtomicBool::new(false));
        self.lock_runs().insert(
            id,
            RunHandle {
                cancel: cancel.clone(),
            },
        );

        let ctx = RunContext {
            config: self.config.clone(),
            pool: self.pool.clone(),
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
            weights: self.weights.clone(),
            report_notes: self.report_notes.clone(),
            progress,
            cancel,
        };
        info!(
            target: "orchestrator",
            run_id = %id,
            niche = %run.input.niche,
            depth = run.input.depth.as_str(),
            "run started"
        );
        counter!("runs_started_total").increment(1);
        gauge!("runs_active").increment(1.0);
        tokio::spawn(async move {
            pipeline::drive(ctx, run).await;
            gauge!("runs_active").decrement(1.0);
        });
        Ok(id)
    }

    /// Latest snapshot. Never blocks on the pipeline.
    pub fn get_status(&self, id: &RunId) -> Result<ProgressSnapshot, AnalysisError> {
        let progress = self
            .tracker
            .get(id)
            .ok_or(AnalysisError::NotFound(*id))?;
        if let Some(err) = progress.persistence_error() {
            return Err(AnalysisError::Persistence(err));
        }
        Ok(progress.snapshot())
    }

    /// Ask the run to stop. No-op on terminal runs.
    pub fn cancel(&self, id: &RunId) -> Result<(), AnalysisError> {
        let progress = self
            .tracker
            .get(id)
            .ok_or(AnalysisError::NotFound(*id))?;
        if progress.snapshot().is_terminal() {
            return Ok(());
        }
        let runs = self.lock_runs();
        let handle = runs.get(id).ok_or(AnalysisError::NotFound(*id))?;
        if !handle.cancel.swap(true, Ordering::SeqCst) {
            counter!("runs_cancel_requests_total").increment(1);
            info!(target: "orchestrator", run_id = %id, "cancel requested");
        }
        Ok(())
    }

    /// Every snapshot of every run, as published.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.tracker.subscribe()
    }

    pub fn watch(&self, id: &RunId) -> Result<watch::Receiver<ProgressSnapshot>, AnalysisError> {
        self.tracker.watch(id).ok_or(AnalysisError::NotFound(*id))
    }

    /// Resolve once the run is terminal.
    pub async fn wait(&self, id: &RunId) -> Result<ProgressSnapshot, AnalysisError> {
        let mut rx = self.watch(id)?;
        let snap = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| AnalysisError::Internal(format!("progress channel closed for {id}")))?;
        Ok(snap.clone())
    }

    /// The finished report, once there is one.
    pub async fn report(&self, id: &RunId) -> Result<Option<ReportArtifact>, AnalysisError> {
        if self.tracker.get(id).is_none() {
            return Err(AnalysisError::NotFound(*id));
        }
        self.store.load_artifact(id).await
    }

    /// Drop runs past retention. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let dropped = self.tracker.prune_expired();
        if dropped > 0 {
            let tracker = &self.tracker;
            self.lock_runs().retain(|id, _| tracker.get(id).is_some());
            info!(target: "orchestrator", dropped, "expired runs pruned");
        }
        dropped
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, RunHandle>> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Periodic retention sweep. Wire this from app startup.
pub fn spawn_retention_sweeper(orchestrator: Arc<Orchestrator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            orchestrator.prune();
        }
    })
}
