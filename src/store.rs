// src/store.rs
//! Run persistence.
//!
//! Writes are keyed by run id and idempotent: a run whose `revision` is older than
//! the stored one is ignored, and rewriting identical state changes nothing.
//! The file store writes `<id>.json.tmp` and renames it over the target, holding
//! a lock per run id so writes for different runs never wait on each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AnalysisError;
use crate::model::{AnalysisRun, ReportArtifact, RunId};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), AnalysisError>;
    async fn save_artifact(&self, artifact: &ReportArtifact) -> Result<(), AnalysisError>;
    async fn load_run(&self, id: &RunId) -> Result<Option<AnalysisRun>, AnalysisError>;
    async fn load_artifact(&self, id: &RunId) -> Result<Option<ReportArtifact>, AnalysisError>;
}

/// Whether `incoming` may replace `stored`.
fn supersedes(stored: Option<&AnalysisRun>, incoming: &AnalysisRun) -> bool {
    match stored {
        None => true,
        Some(s) => incoming.revision > s.revision,
    }
}

// --- In-memory ---

#[derive(Default)]
pub struct InMemoryStore {
    runs: Mutex<HashMap<RunId, AnalysisRun>>,
    artifacts: Mutex<HashMap<RunId, ReportArtifact>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), AnalysisError> {
        let mut g = self.runs.lock().await;
        if supersedes(g.get(&run.id), run) {
            g.insert(run.id, run.clone());
        } else {
            debug!(target: "store", run_id = %run.id, revision = run.revision, "stale run write ignored");
        }
        Ok(())
    }

    async fn save_artifact(&self, artifact: &ReportArtifact) -> Result<(), AnalysisError> {
        self.artifacts
            .lock()
            .await
            .insert(artifact.run_id, artifact.clone());
        Ok(())
    }

    async fn load_run(&self, id: &RunId) -> Result<Option<AnalysisRun>, AnalysisError> {
        Ok(self.runs.lock().await.get(id).cloned())
    }

    async fn load_artifact(&self, id: &RunId) -> Result<Option<ReportArtifact>, AnalysisError> {
        Ok(self.artifacts.lock().await.get(id).cloned())
    }
}

// --- JSON files ---

/// One JSON file per run under `<dir>/runs`, one per artifact under `<dir>/artifacts`.
pub struct JsonFileStore {
    dir: PathBuf,
    // Serializes read-compare-write per run so revision checks are not racy.
    locks: std::sync::Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The write lock for one run. Locks nobody holds are dropped on the way.
    fn run_lock(&self, id: &RunId) -> Arc<Mutex<()>> {
        let mut g = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        g.retain(|k, l| k == id || Arc::strong_count(l) > 1);
        g.entry(*id).or_default().clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_path(&self, id: &RunId) -> PathBuf {
        self.dir.join("runs").join(format!("{id}.json"))
    }

    fn artifact_path(&self, id: &RunId) -> PathBuf {
        self.dir.join("artifacts").join(format!("{id}.json"))
    }
}

fn persistence(op: &str, path: &Path, e: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::Persistence(format!("{op} {}: {e}", path.display()))
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<(), AnalysisError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| persistence("creating", parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| persistence("writing", &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| persistence("renaming", &tmp, e))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, AnalysisError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| persistence("decoding", path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(persistence("reading", path, e)),
    }
}

#[async_trait]
impl RunStore for JsonFileStore {
    async fn save_run(&self, run: &AnalysisRun) -> Result<(), AnalysisError> {
        let path = self.run_path(&run.id);
        let lock = self.run_lock(&run.id);
        let _guard = lock.lock().await;
        let stored: Option<AnalysisRun> = read_json(&path).await?;
        if !supersedes(stored.as_ref(), run) {
            debug!(target: "store", run_id = %run.id, revision = run.revision, "stale run write ignored");
            return Ok(());
        }
        let body = serde_json::to_vec_pretty(run).map_err(|e| persistence("encoding", &path, e))?;
        write_atomic(&path, &body).await
    }

    async fn save_artifact(&self, artifact: &ReportArtifact) -> Result<(), AnalysisError> {
        let path = self.artifact_path(&artifact.run_id);
        let body =
            serde_json::to_vec_pretty(artifact).map_err(|e| persistence("encoding", &path, e))?;
        let lock = self.run_lock(&artifact.run_id);
        let _guard = lock.lock().await;
        write_atomic(&path, &body).await
    }

    async fn load_run(&self, id: &RunId) -> Result<Option<AnalysisRun>, AnalysisError> {
        read_json(&self.run_path(id)).await
    }

    async fn load_artifact(&self, id: &RunId) -> Result<Option<ReportArtifact>, AnalysisError> {
        read_json(&self.artifact_path(id)).await
    }
}
