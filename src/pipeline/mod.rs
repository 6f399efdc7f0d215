// src/pipeline/mod.rs
//! Stage pipeline for one run: collect → analyze → synthesize.
//!
//! [`drive`] owns the run record while it executes. Every stage transition is
//! persisted before the stage starts; store failures are recorded on the run's
//! progress and never abort the pipeline.

pub mod analyze;
pub mod chunking;
pub mod collect;
pub mod synthesize;
pub mod verify;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{AnalysisError, FailureReason};
use crate::fetch::SourceFetcher;
use crate::model::{AnalysisRun, ChunkStatus, ReportArtifact, Stage};
use crate::progress::RunProgress;
use crate::providers::ProviderPool;
use crate::source_weights::SourceWeightsConfig;
use crate::store::RunStore;

/// Everything a run's stages need. Cheap to clone.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<OrchestratorConfig>,
    pub pool: Arc<ProviderPool>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub store: Arc<dyn RunStore>,
    pub weights: Arc<SourceWeightsConfig>,
    /// Leading notes for every report, e.g. a placeholder provider in use.
    pub report_notes: Arc<Vec<String>>,
    pub progress: Arc<RunProgress>,
    pub cancel: Arc<AtomicBool>,
}

impl RunContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> Result<(), AnalysisError> {
        if self.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Save the run; remember (or clear) the failure on the run's progress.
    pub async fn persist(&self, run: &AnalysisRun) {
        match self.store.save_run(run).await {
            Ok(()) => self.progress.set_persistence_error(None),
            Err(e) => {
                counter!("store_errors_total").increment(1);
                warn!(target: "store", run_id = %run.id, error = %e, "run save failed");
                self.progress.set_persistence_error(Some(e.to_string()));
            }
        }
    }

    async fn enter(&self, run: &mut AnalysisRun, stage: Stage, message: &str) -> Result<(), AnalysisError> {
        if !run.advance(stage) {
            return Err(AnalysisError::Internal(format!(
                "illegal transition {} -> {}",
                run.stage.as_str(),
                stage.as_str()
            )));
        }
        info!(target: "orchestrator", run_id = %run.id, stage = stage.as_str(), "stage entered");
        self.persist(run).await;
        self.progress.begin_stage(stage, message);
        Ok(())
    }
}

/// Run the whole pipeline, then record the terminal state.
/// Returns the run as last persisted.
pub async fn drive(ctx: RunContext, mut run: AnalysisRun) -> AnalysisRun {
    let t0 = Instant::now();
    let outcome = execute(&ctx, &mut run).await;
    histogram!("run_duration_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

    match outcome {
        Ok(report) => {
            if let Err(e) = ctx.store.save_artifact(&report).await {
                counter!("store_errors_total").increment(1);
                warn!(target: "store", run_id = %run.id, error = %e, "artifact save failed");
                ctx.progress.set_artifact_error(e.to_string());
            }
            run.advance(Stage::Done);
            ctx.persist(&run).await;
            ctx.progress.complete("report ready");
            counter!("runs_total", "outcome" => "completed").increment(1);
            info!(
                target: "orchestrator",
                run_id = %run.id,
                sections = report.sections.len(),
                notes = report.notes.len(),
                "run completed"
            );
        }
        Err(e) => {
            let reason = e.failure_reason().unwrap_or(FailureReason::Internal);
            run.fail(reason);
            ctx.persist(&run).await;
            ctx.progress.fail(reason, e.to_string());
            counter!("runs_total", "outcome" => reason.as_str()).increment(1);
            warn!(target: "orchestrator", run_id = %run.id, reason = reason.as_str(), error = %e, "run failed");
        }
    }
    run
}

async fn execute(ctx: &RunContext, run: &mut AnalysisRun) -> Result<ReportArtifact, AnalysisError> {
    ctx.check_cancelled()?;
    let input = run.input.clone();
    let profile = ctx.config.profile(input.depth);

    // Collect
    ctx.enter(run, Stage::Collecting, "collecting sources").await?;
    let collected = collect::collect(ctx, &input, profile).await;
    run.documents_ok = collected.documents.len();
    run.documents_failed = collected.failed;
    if collected.degraded {
        run.mark_degraded();
    }
    ctx.check_cancelled()?;
    if collected.documents.is_empty() {
        return Err(AnalysisError::NoData);
    }

    // Analyze
    ctx.enter(run, Stage::Analyzing, "analyzing content").await?;
    let planned = chunking::plan(
        &collected.documents,
        &ctx.weights,
        ctx.config.chunk_chars,
        profile.max_chunks,
    );
    let chunks = analyze::analyze(ctx, &input, planned).await?;
    run.chunks_total = chunks.len();
    run.chunks_succeeded = analyze::count(&chunks, ChunkStatus::Succeeded);
    run.chunks_exhausted = analyze::count(&chunks, ChunkStatus::Exhausted);
    if run.chunks_exhausted > 0 {
        run.mark_degraded();
    }
    ctx.check_cancelled()?;
    analyze::check_success_ratio(&chunks, ctx.config.min_success_ratio)?;

    // Synthesize
    ctx.enter(run, Stage::Synthesizing, "writing report").await?;
    let report = synthesize::synthesize(ctx, run, &collected, &chunks).await?;
    ctx.check_cancelled()?;
    Ok(report)
}
