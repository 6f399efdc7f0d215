// src/pipeline/verify.rs
//! Optional verification pass: a reviewer model approves or rejects each report
//! section and the narrative.
//!
//! Items run through the provider pool under the worker pool bound. A provider
//! failure or an answer without a verdict marks the item `error`; nothing here
//! fails the run.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::model::{InputSpec, ReportSection, Verdict, VerificationSummary, VerifiedItem};
use crate::pipeline::RunContext;
use crate::prompts;

pub const NARRATIVE_LABEL: &str = "Narrative";

/// Sections with findings, then the narrative.
pub fn items(sections: &[ReportSection], narrative: &str) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = sections
        .iter()
        .filter(|s| !s.findings.is_empty())
        .map(|s| (s.title.clone(), s.findings.join("\n")))
        .collect();
    if !narrative.trim().is_empty() {
        out.push((NARRATIVE_LABEL.to_string(), narrative.to_string()));
    }
    out
}

pub async fn verify(
    ctx: &RunContext,
    input: &InputSpec,
    sections: &[ReportSection],
    narrative: &str,
) -> VerificationSummary {
    let t0 = Instant::now();
    let items = items(sections, narrative);
    let permits = Arc::new(Semaphore::new(ctx.config.worker_pool_size.max(1)));
    let input = Arc::new(input.clone());
    let timeout = ctx.config.provider_timeout();
    let mut set = JoinSet::new();

    for (idx, (label, text)) in items.into_iter().enumerate() {
        let permits = permits.clone();
        let pool = ctx.pool.clone();
        let cancel = ctx.cancel.clone();
        let input = input.clone();
        set.spawn(async move {
            let skipped = |reason: &str| VerifiedItem {
                label: label.clone(),
                verdict: Verdict::Error,
                reason: Some(reason.to_string()),
            };
            let Ok(_permit) = permits.acquire_owned().await else {
                return (idx, skipped("not verified"));
            };
            if cancel.load(std::sync::atomic::Ordering::SeqCst) {
                return (idx, skipped("cancelled"));
            }
            let request = prompts::verify_request(&input, &label, &text);
            let item = match pool.complete(&request, timeout, Some(cancel.as_ref())).await {
                Ok(done) => {
                    let (verdict, reason) = prompts::parse_verdict(&done.text);
                    VerifiedItem {
                        label: label.clone(),
                        verdict,
                        reason,
                    }
                }
                Err(ex) if ex.cancelled => skipped("cancelled"),
                Err(ex) => {
                    warn!(target: "synthesize", item = %label, attempts = ex.attempts, "verification call exhausted providers");
                    skipped("no provider answered")
                }
            };
            counter!("verifications_total", "verdict" => item.verdict.as_str()).increment(1);
            (idx, item)
        });
    }

    let mut verified = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(pair) => verified.push(pair),
            Err(e) => warn!(target: "synthesize", error = %e, "verification task aborted"),
        }
    }
    verified.sort_by_key(|(idx, _)| *idx);
    let summary = VerificationSummary::from_items(verified.into_iter().map(|(_, item)| item).collect());

    histogram!("stage_ms", "stage" => "verifying").record(t0.elapsed().as_secs_f64() * 1_000.0);
    info!(
        target: "synthesize",
        run_id = %ctx.progress.run_id(),
        approved = summary.approved,
        rejected = summary.rejected,
        errors = summary.errors,
        quality_score = summary.quality_score,
        "report verified"
    );
    summary
}

/// Report note for rejected items, if any.
pub fn rejection_note(summary: &VerificationSummary) -> Option<String> {
    let rejected: Vec<&str> = summary
        .items
        .iter()
        .filter(|i| i.verdict == Verdict::Rejected)
        .map(|i| i.label.as_str())
        .collect();
    if rejected.is_empty() {
        return None;
    }
    Some(format!(
        "verification rejected {} of {} items: {}",
        rejected.len(),
        summary.items.len(),
        rejected.join(", ")
    ))
}
