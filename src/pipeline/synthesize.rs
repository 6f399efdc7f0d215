// src/pipeline/synthesize.rs
//! Synthesize stage: merge chunk results into the report artifact.
//!
//! Output order never depends on completion order: sections follow capability
//! order and findings follow chunk index. With `verify_report` set, the sections
//! and narrative then go through [`verify`].

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::error::AnalysisError;
use crate::model::{
    AnalysisChunk, AnalysisRun, Capability, ChunkStatus, InputSpec, ReportArtifact, ReportSection,
    SourceCitation,
};
use crate::pipeline::collect::Collected;
use crate::pipeline::{verify, RunContext};
use crate::prompts;
use crate::source_weights::SourceWeightsConfig;

/// Cap on the findings digest sent for the narrative.
const MAX_DIGEST_CHARS: usize = 8_000;
/// Findings per section quoted in the local narrative.
const LOCAL_FINDINGS_PER_SECTION: usize = 2;

pub async fn synthesize(
    ctx: &RunContext,
    run: &AnalysisRun,
    collected: &Collected,
    chunks: &[AnalysisChunk],
) -> Result<ReportArtifact, AnalysisError> {
    let t0 = Instant::now();
    if !chunks.iter().any(|c| c.status == ChunkStatus::Succeeded) {
        return Err(AnalysisError::Internal(
            "no successful chunks reached synthesis".into(),
        ));
    }

    let sections = build_sections(chunks);
    let mut notes: Vec<String> = ctx.report_notes.iter().cloned().collect();
    notes.extend(collected.notes.iter().cloned());
    notes.extend(exhaustion_notes(&sections));
    let sources = cite_sources(collected, &ctx.weights);

    let narrative = if ctx.config.ai_narrative && !ctx.is_cancelled() {
        let digest = digest(&sections);
        let request = prompts::narrative_request(&run.input, &digest);
        match ctx
            .pool
            .complete(&request, ctx.config.provider_timeout(), Some(ctx.cancel.as_ref()))
            .await
        {
            Ok(done) if !prompts::is_empty_answer(&done.text) => {
                counter!("narratives_total", "source" => "provider").increment(1);
                done.text
            }
            Ok(_) => {
                counter!("narratives_total", "source" => "local").increment(1);
                local_narrative(&run.input, &sections)
            }
            Err(ex) => {
                warn!(target: "synthesize", run_id = %run.id, attempts = ex.attempts, "narrative fell back to local merge");
                counter!("narratives_total", "source" => "local").increment(1);
                notes.push("narrative written locally: no provider produced one".to_string());
                local_narrative(&run.input, &sections)
            }
        }
    } else {
        counter!("narratives_total", "source" => "local").increment(1);
        local_narrative(&run.input, &sections)
    };

    let verification = if ctx.config.verify_report && !ctx.is_cancelled() {
        let summary = verify::verify(ctx, &run.input, &sections, &narrative).await;
        notes.extend(verify::rejection_note(&summary));
        Some(summary)
    } else {
        None
    };

    histogram!("stage_ms", "stage" => "synthesizing").record(t0.elapsed().as_secs_f64() * 1_000.0);
    info!(
        target: "synthesize",
        run_id = %run.id,
        sections = sections.len(),
        sources = sources.len(),
        notes = notes.len(),
        "report built"
    );

    Ok(ReportArtifact {
        run_id: run.id,
        niche: run.input.niche.clone(),
        sections,
        narrative,
        sources,
        notes,
        verification,
        generated_at: Utc::now(),
    })
}

/// One section per capability, findings in chunk-index order.
/// `NONE` answers and exact repeats count as succeeded but add no finding.
pub fn build_sections(chunks: &[AnalysisChunk]) -> Vec<ReportSection> {
    let mut ordered: Vec<&AnalysisChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    Capability::ALL
        .iter()
        .map(|&cap| {
            let mut seen = HashSet::new();
            let mut findings = Vec::new();
            let mut attempted = 0;
            let mut succeeded = 0;
            for c in ordered.iter().filter(|c| c.capability == cap) {
                attempted += 1;
                if c.status != ChunkStatus::Succeeded {
                    continue;
                }
                succeeded += 1;
                let Some(text) = c.result.as_deref().map(str::trim) else {
                    continue;
                };
                if text.is_empty() || prompts::is_empty_answer(text) {
                    continue;
                }
                if seen.insert(text.to_string()) {
                    findings.push(text.to_string());
                }
            }
            ReportSection {
                capability: cap,
                title: cap.title().to_string(),
                findings,
                chunks_attempted: attempted,
                chunks_succeeded: succeeded,
            }
        })
        .collect()
}

fn exhaustion_notes(sections: &[ReportSection]) -> Vec<String> {
    sections
        .iter()
        .filter(|s| s.chunks_succeeded < s.chunks_attempted)
        .map(|s| {
            format!(
                "{} of {} {} chunks could not be analyzed",
                s.chunks_attempted - s.chunks_succeeded,
                s.chunks_attempted,
                s.capability
            )
        })
        .collect()
}

fn cite_sources(collected: &Collected, weights: &SourceWeightsConfig) -> Vec<SourceCitation> {
    collected
        .documents
        .iter()
        .map(|d| {
            let reliability = weights.weight_for(&d.url);
            SourceCitation {
                url: d.url.clone(),
                reliability,
                confidence: SourceWeightsConfig::confidence_label(reliability).to_string(),
            }
        })
        .collect()
}

fn digest(sections: &[ReportSection]) -> String {
    let mut out = String::new();
    for s in sections.iter().filter(|s| !s.findings.is_empty()) {
        out.push_str(&format!("## {}\n", s.title));
        for f in &s.findings {
            out.push_str("- ");
            out.push_str(f);
            out.push('\n');
        }
    }
    if out.chars().count() > MAX_DIGEST_CHARS {
        out = out.chars().take(MAX_DIGEST_CHARS).collect();
    }
    out
}

/// Deterministic narrative from the sections alone.
pub fn local_narrative(input: &InputSpec, sections: &[ReportSection]) -> String {
    let mut parts = vec![format!("Market overview for {}.", input.niche)];
    for s in sections.iter().filter(|s| !s.findings.is_empty()) {
        let lead: Vec<&str> = s
            .findings
            .iter()
            .take(LOCAL_FINDINGS_PER_SECTION)
            .map(|f| f.lines().next().unwrap_or("").trim())
            .filter(|l| !l.is_empty())
            .collect();
        if !lead.is_empty() {
            parts.push(format!("{}: {}", s.title, lead.join("; ")));
        }
    }
    if parts.len() == 1 {
        parts.push("The analyzed sources held no specific findings.".to_string());
    }
    parts.join("\n")
}
