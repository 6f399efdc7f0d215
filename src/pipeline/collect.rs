// src/pipeline/collect.rs
//! Collect stage: one fetch per query, bounded by `fetch_concurrency`.
//!
//! Progress moves per resolved document. Slots a query leaves unfilled are
//! resolved when the query finishes; a timed-out query counts as one failed
//! document.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::DepthProfile;
use crate::error::AnalysisError;
use crate::fetch::{build_queries, dedup_by_url};
use crate::model::{InputSpec, SourceDocument};
use crate::pipeline::RunContext;

/// Result of the collect stage.
#[derive(Debug, Default)]
pub struct Collected {
    /// Usable documents, de-duplicated by URL, in query order.
    pub documents: Vec<SourceDocument>,
    /// Documents that came back with a failed status or empty content, plus one
    /// per timed-out query.
    pub failed: usize,
    /// True if any fetch failure was absorbed.
    pub degraded: bool,
    /// One line per absorbed failure, carried into the report.
    pub notes: Vec<String>,
}

enum QueryResult {
    Fetched(Vec<SourceDocument>),
    TimedOut,
    Skipped,
}

pub async fn collect(ctx: &RunContext, input: &InputSpec, profile: DepthProfile) -> Collected {
    let t0 = Instant::now();
    let queries = build_queries(input, profile.queries);
    ctx.progress
        .sources_planned(queries.len() * profile.max_sources.max(1));

    let permits = Arc::new(Semaphore::new(ctx.config.fetch_concurrency.max(1)));
    let mut set = JoinSet::new();
    for (idx, query) in queries.iter().cloned().enumerate() {
        let permits = permits.clone();
        let fetcher = ctx.fetcher.clone();
        let cancel = ctx.cancel.clone();
        let timeout = ctx.config.fetch_timeout();
        let max_sources = profile.max_sources;
        set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (idx, query, QueryResult::Skipped);
            };
            if cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return (idx, query, QueryResult::Skipped);
            }
            let res = match tokio::time::timeout(timeout, fetcher.fetch(&query, max_sources)).await {
                Ok(mut docs) => {
                    docs.truncate(max_sources);
                    QueryResult::Fetched(docs)
                }
                Err(_) => QueryResult::TimedOut,
            };
            (idx, query, res)
        });
    }

    let mut per_query: Vec<(usize, String, QueryResult)> = Vec::with_capacity(queries.len());
    while let Some(joined) = set.join_next().await {
        let (idx, query, res) = match joined {
            Ok(t) => t,
            Err(e) => {
                warn!(target: "collect", error = %e, "fetch task aborted");
                continue;
            }
        };
        let slots = profile.max_sources.max(1);
        match &res {
            QueryResult::Fetched(docs) => {
                for d in docs {
                    let usable = d.is_usable();
                    ctx.progress.document_resolved(
                        usable,
                        format!("'{query}': {} {}", d.url, if usable { "ok" } else { "failed" }),
                    );
                }
                if docs.iter().all(|d| !d.is_usable()) {
                    ctx.progress.mark_degraded();
                }
                ctx.progress.query_resolved(
                    slots.saturating_sub(docs.len()),
                    0,
                    format!("fetched '{query}'"),
                );
            }
            QueryResult::TimedOut => {
                ctx.progress
                    .query_resolved(slots, 1, format!("fetch for '{query}' timed out"));
            }
            QueryResult::Skipped => debug!(target: "collect", query = %query, "fetch skipped"),
        }
        per_query.push((idx, query, res));
    }
    per_query.sort_by_key(|(idx, _, _)| *idx);

    let mut out = Collected::default();
    let mut usable = Vec::new();
    for (_, query, res) in per_query {
        let docs = match res {
            QueryResult::Fetched(docs) => docs,
            QueryResult::TimedOut => {
                out.failed += 1;
                Vec::new()
            }
            QueryResult::Skipped => continue,
        };
        let before = usable.len();
        let fetched = docs.len();
        for d in docs {
            if d.is_usable() {
                usable.push(d);
            } else {
                out.failed += 1;
                out.degraded = true;
                if let Some(err) = &d.error {
                    debug!(target: "collect", url = %d.url, error = %err, "source failed");
                }
            }
        }
        let kept = usable.len() - before;
        if kept == 0 {
            let e = AnalysisError::SourceUnavailable { query };
            warn!(target: "collect", "{e}");
            out.degraded = true;
            out.notes.push(e.to_string());
        } else if kept < fetched {
            out.notes.push(format!(
                "{} of {fetched} sources failed for query '{query}'",
                fetched - kept
            ));
        }
    }

    let (documents, duplicates) = dedup_by_url(usable);
    out.documents = documents;
    histogram!("stage_ms", "stage" => "collecting").record(t0.elapsed().as_secs_f64() * 1_000.0);
    info!(
        target: "collect",
        run_id = %ctx.progress.run_id(),
        kept = out.documents.len(),
        failed = out.failed,
        duplicates,
        "collect finished"
    );
    out
}
