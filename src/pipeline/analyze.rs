// src/pipeline/analyze.rs
//! Analyze stage: dispatch chunks to the provider pool through a bounded worker pool.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::AnalysisError;
use crate::model::{AnalysisChunk, ChunkStatus, InputSpec};
use crate::pipeline::RunContext;
use crate::prompts;

/// Resolve every chunk. Returns them ordered by index.
///
/// Once the run's cancel flag is seen, chunks that have not started stay
/// `Pending`; in-flight calls finish and are recorded.
pub async fn analyze(
    ctx: &RunContext,
    input: &InputSpec,
    chunks: Vec<AnalysisChunk>,
) -> Result<Vec<AnalysisChunk>, AnalysisError> {
    let t0 = Instant::now();
    let total = chunks.len();
    ctx.progress.chunks_planned(total);

    let permits = Arc::new(Semaphore::new(ctx.config.worker_pool_size.max(1)));
    let input = Arc::new(input.clone());
    let timeout = ctx.config.provider_timeout();
    let mut set = JoinSet::new();

    for mut chunk in chunks {
        let permits = permits.clone();
        let pool = ctx.pool.clone();
        let cancel = ctx.cancel.clone();
        let progress = ctx.progress.clone();
        let input = input.clone();
        set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return chunk;
            };
            if cancel.load(Ordering::SeqCst) {
                return chunk;
            }

            let request = prompts::chunk_request(&input, chunk.capability, &chunk.input);
            match pool.complete(&request, timeout, Some(cancel.as_ref())).await {
                Ok(done) => {
                    chunk.result = Some(done.text);
                    chunk.provider = Some(done.provider);
                    chunk.attempts = done.attempts;
                    chunk.status = ChunkStatus::Succeeded;
                    counter!("chunks_total", "outcome" => "succeeded").increment(1);
                    progress.chunk_resolved(
                        true,
                        format!("chunk {} ({}) analyzed", chunk.index, chunk.capability),
                    );
                }
                Err(ex) if ex.cancelled => {
                    chunk.attempts = ex.attempts;
                    debug!(target: "analyze", chunk = chunk.index, "chunk abandoned on cancel");
                }
                Err(ex) => {
                    let failure = AnalysisError::ProviderFailure {
                        capability: chunk.capability.to_string(),
                        attempts: ex.attempts,
                    };
                    chunk.attempts = ex.attempts;
                    chunk.status = ChunkStatus::Exhausted;
                    chunk.last_error = Some(match &ex.last_error {
                        Some(e) => format!("{failure}: {e}"),
                        None => format!("{failure}: no eligible provider"),
                    });
                    counter!("chunks_total", "outcome" => "exhausted").increment(1);
                    warn!(
                        target: "analyze",
                        chunk = chunk.index,
                        capability = chunk.capability.as_str(),
                        attempts = ex.attempts,
                        "chunk exhausted all providers"
                    );
                    progress.chunk_resolved(
                        false,
                        format!("chunk {} ({}) failed", chunk.index, chunk.capability),
                    );
                }
            }
            chunk
        });
    }

    let mut out = Vec::with_capacity(total);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(chunk) => out.push(chunk),
            Err(e) => return Err(AnalysisError::Internal(format!("chunk worker failed: {e}"))),
        }
    }
    out.sort_by_key(|c| c.index);

    histogram!("stage_ms", "stage" => "analyzing").record(t0.elapsed().as_secs_f64() * 1_000.0);
    info!(
        target: "analyze",
        run_id = %ctx.progress.run_id(),
        total,
        succeeded = count(&out, ChunkStatus::Succeeded),
        exhausted = count(&out, ChunkStatus::Exhausted),
        "analyze finished"
    );
    Ok(out)
}

pub fn count(chunks: &[AnalysisChunk], status: ChunkStatus) -> usize {
    chunks.iter().filter(|c| c.status == status).count()
}

/// Gate into synthesis. Zero chunks is never enough.
pub fn check_success_ratio(chunks: &[AnalysisChunk], min_ratio: f64) -> Result<(), AnalysisError> {
    let total = chunks.len();
    let succeeded = count(chunks, ChunkStatus::Succeeded);
    if total == 0 || (succeeded as f64) < min_ratio * (total as f64) {
        return Err(AnalysisError::InsufficientAnalysis {
            succeeded,
            total,
            min_ratio,
        });
    }
    Ok(())
}
