//! # Progress Tracker
//! Process-wide, per-run progress state.
//!
//! Each run has one authoritative accumulator ([`RunProgress`]): atomic counters of
//! resolved work units plus a `watch` channel holding the latest snapshot. Every
//! update goes through `watch::Sender::send_modify`, which serializes writers;
//! inside it the percent can only go up and the stage can only move forward, and
//! the process-wide broadcast is sent while still holding that lock. No reader,
//! polling or subscribed, can observe a run's percent moving backward.
//!
//! Stage weights: collect 40 %, analyze 30 %, synthesize 30 %. Collect advances per
//! resolved source slot (queries × max sources), analyze per resolved chunk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch};

use crate::error::FailureReason;
use crate::model::{ProgressSnapshot, RunId, RunStatus, Stage};

const COLLECT_WEIGHT: f64 = 40.0;
const ANALYZE_WEIGHT: f64 = 30.0;
const EVENT_BUFFER: usize = 1024;

/// Work-unit accumulator and snapshot channel for one run.
#[derive(Debug)]
pub struct RunProgress {
    run_id: RunId,
    tx: watch::Sender<ProgressSnapshot>,
    events: broadcast::Sender<ProgressSnapshot>,
    sources_total: AtomicUsize,
    sources_done: AtomicUsize,
    documents_ok: AtomicUsize,
    documents_failed: AtomicUsize,
    chunks_total: AtomicUsize,
    chunks_succeeded: AtomicUsize,
    chunks_exhausted: AtomicUsize,
    degraded: AtomicBool,
    finished_at: Mutex<Option<Instant>>,
    persistence_error: Mutex<Option<String>>,
    artifact_error: Mutex<Option<String>>,
}

impl RunProgress {
    fn new(run_id: RunId, events: broadcast::Sender<ProgressSnapshot>) -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::pending(run_id));
        Self {
            run_id,
            tx,
            events,
            sources_total: AtomicUsize::new(0),
            sources_done: AtomicUsize::new(0),
            documents_ok: AtomicUsize::new(0),
            documents_failed: AtomicUsize::new(0),
            chunks_total: AtomicUsize::new(0),
            chunks_succeeded: AtomicUsize::new(0),
            chunks_exhausted: AtomicUsize::new(0),
            degraded: AtomicBool::new(false),
            finished_at: Mutex::new(None),
            persistence_error: Mutex::new(None),
            artifact_error: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn begin_stage(&self, stage: Stage, message: impl Into<String>) {
        self.publish(Some(stage), None, message.into());
    }

    /// Source slots the collect stage can fill: queries × max sources per query.
    pub fn sources_planned(&self, n: usize) {
        self.sources_total.store(n, Ordering::SeqCst);
    }

    /// One fetched document resolved, usable or not.
    pub fn document_resolved(&self, usable: bool, message: impl Into<String>) {
        if usable {
            self.documents_ok.fetch_add(1, Ordering::SeqCst);
        } else {
            self.documents_failed.fetch_add(1, Ordering::SeqCst);
            self.degraded.store(true, Ordering::SeqCst);
        }
        self.sources_done.fetch_add(1, Ordering::SeqCst);
        self.publish(None, None, message.into());
    }

    /// A query finished. `unfilled` slots it returned no document for are resolved
    /// as well; `lost` documents (a timed-out call) count as failed.
    /// Publishes only when something changed.
    pub fn query_resolved(&self, unfilled: usize, lost: usize, message: impl Into<String>) {
        if unfilled == 0 && lost == 0 {
            return;
        }
        if lost > 0 {
            self.documents_failed.fetch_add(lost, Ordering::SeqCst);
            self.degraded.store(true, Ordering::SeqCst);
        }
        self.sources_done.fetch_add(unfilled, Ordering::SeqCst);
        self.publish(None, None, message.into());
    }

    /// Flag the run as degraded without publishing.
    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    pub fn chunks_planned(&self, n: usize) {
        self.chunks_total.store(n, Ordering::SeqCst);
        self.publish(None, None, format!("{n} chunks planned"));
    }

    pub fn chunk_resolved(&self, succeeded: bool, message: impl Into<String>) {
        if succeeded {
            self.chunks_succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.chunks_exhausted.fetch_add(1, Ordering::SeqCst);
            self.degraded.store(true, Ordering::SeqCst);
        }
        self.publish(None, None, message.into());
    }

    // Finished is marked before the terminal snapshot goes out, so anyone who saw
    // it also sees the retention clock running.
    pub fn complete(&self, message: impl Into<String>) {
        self.mark_finished();
        self.publish(Some(Stage::Done), None, message.into());
    }

    pub fn fail(&self, reason: FailureReason, message: impl Into<String>) {
        self.mark_finished();
        self.publish(Some(Stage::Failed), Some(reason), message.into());
    }

    /// Result of the latest run write. A later successful write clears it.
    pub fn set_persistence_error(&self, err: Option<String>) {
        *self
            .persistence_error
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = err;
    }

    /// The report could not be stored. Run writes never clear this.
    pub fn set_artifact_error(&self, err: String) {
        *self.artifact_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
    }

    /// Artifact failure first, then the latest run-write failure.
    pub fn persistence_error(&self) -> Option<String> {
        let artifact = self
            .artifact_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        artifact.or_else(|| {
            self.persistence_error
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
        })
    }

    fn mark_finished(&self) {
        let mut g = self.finished_at.lock().unwrap_or_else(|p| p.into_inner());
        g.get_or_insert_with(Instant::now);
    }

    fn finished_at(&self) -> Option<Instant> {
        *self.finished_at.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, stage: Option<Stage>, failure: Option<FailureReason>, message: String) {
        let events = &self.events;
        self.tx.send_modify(|snap| {
            if let Some(next) = stage {
                if snap.stage.can_advance_to(next) {
                    snap.stage = next;
                    if next == Stage::Failed {
                        snap.failure = failure;
                    }
                }
            }

            snap.documents_ok = self.documents_ok.load(Ordering::SeqCst);
            snap.documents_failed = self.documents_failed.load(Ordering::SeqCst);
            snap.chunks_total = self.chunks_total.load(Ordering::SeqCst);
            snap.chunks_succeeded = self.chunks_succeeded.load(Ordering::SeqCst);
            snap.chunks_exhausted = self.chunks_exhausted.load(Ordering::SeqCst);
            snap.degraded = self.degraded.load(Ordering::SeqCst);
            snap.status = status_for(snap.stage, snap.degraded);

            let target = percent_for(
                snap.stage,
                self.sources_done.load(Ordering::SeqCst),
                self.sources_total.load(Ordering::SeqCst),
                snap.chunks_succeeded + snap.chunks_exhausted,
                snap.chunks_total,
            );
            snap.percent = snap.percent.max(target);
            snap.message = message;
            snap.timestamp = Utc::now();

            // Sent under the watch lock so subscribers see snapshots in order.
            let _ = events.send(snap.clone());
        });
    }
}

fn status_for(stage: Stage, degraded: bool) -> RunStatus {
    match stage {
        Stage::Pending => RunStatus::Pending,
        Stage::Done => RunStatus::Completed,
        Stage::Failed => RunStatus::Failed,
        _ if degraded => RunStatus::PartiallyFailed,
        _ => RunStatus::Running,
    }
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done.min(total) as f64) / (total as f64)
    }
}

/// Target percent for the stage and resolved work. Callers take the max with the
/// previous value; `Failed` therefore keeps whatever was reached.
fn percent_for(stage: Stage, s_done: usize, s_total: usize, c_done: usize, c_total: usize) -> u8 {
    let p = match stage {
        Stage::Pending | Stage::Failed => 0.0,
        Stage::Collecting => COLLECT_WEIGHT * ratio(s_done, s_total),
        Stage::Analyzing => COLLECT_WEIGHT + ANALYZE_WEIGHT * ratio(c_done, c_total),
        Stage::Synthesizing => COLLECT_WEIGHT + ANALYZE_WEIGHT,
        Stage::Done => 100.0,
    };
    p.floor().clamp(0.0, 100.0) as u8
}

/// Registry of all runs' progress in this process.
#[derive(Debug)]
pub struct ProgressTracker {
    runs: RwLock<HashMap<RunId, Arc<RunProgress>>>,
    events: broadcast::Sender<ProgressSnapshot>,
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(retention: Duration) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_BUFFER);
        Self {
            runs: RwLock::new(HashMap::new()),
            events,
            retention,
        }
    }

    pub fn register(&self, run_id: RunId) -> Arc<RunProgress> {
        let progress = Arc::new(RunProgress::new(run_id, self.events.clone()));
        self.runs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id, progress.clone());
        progress
    }

    /// Live or recently finished run; `None` once retention has passed.
    pub fn get(&self, run_id: &RunId) -> Option<Arc<RunProgress>> {
        let g = self.runs.read().unwrap_or_else(|p| p.into_inner());
        let p = g.get(run_id)?;
        if self.is_expired(p) {
            return None;
        }
        Some(p.clone())
    }

    pub fn snapshot(&self, run_id: &RunId) -> Option<ProgressSnapshot> {
        self.get(run_id).map(|p| p.snapshot())
    }

    /// All snapshots of all runs, in publish order per run.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.events.subscribe()
    }

    pub fn watch(&self, run_id: &RunId) -> Option<watch::Receiver<ProgressSnapshot>> {
        self.get(run_id).map(|p| p.subscribe())
    }

    /// Drop finished runs past retention. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let mut g = self.runs.write().unwrap_or_else(|p| p.into_inner());
        let before = g.len();
        g.retain(|_, p| !self.is_expired(p));
        before - g.len()
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, p: &RunProgress) -> bool {
        p.finished_at()
            .is_some_and(|t| t.elapsed() >= self.retention)
    }
}
