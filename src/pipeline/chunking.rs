// src/pipeline/chunking.rs
//! Turn documents into capability chunks under the tier's chunk budget.

use std::cmp::Ordering;

use crate::model::{AnalysisChunk, Capability, SourceDocument};
use crate::source_weights::SourceWeightsConfig;

/// Chunks for the analyze stage, indexed from 0 in dispatch order.
///
/// Documents are taken most reliable first (ties keep collect order). Each text
/// piece yields one chunk per capability, so the budget is rounded down to a
/// multiple of the capability count, with at least one piece.
pub fn plan(
    documents: &[SourceDocument],
    weights: &SourceWeightsConfig,
    chunk_chars: usize,
    max_chunks: usize,
) -> Vec<AnalysisChunk> {
    let caps = Capability::ALL.len();
    let max_pieces = (max_chunks / caps).max(1);

    let mut ranked: Vec<(f32, &SourceDocument)> = documents
        .iter()
        .filter(|d| d.is_usable())
        .map(|d| (weights.weight_for(&d.url), d))
        .collect();
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let mut chunks = Vec::with_capacity(max_pieces * caps);
    let mut pieces = 0usize;
    'docs: for (_, doc) in ranked {
        for piece in split_text(&doc.content, chunk_chars) {
            if pieces == max_pieces {
                break 'docs;
            }
            pieces += 1;
            for cap in Capability::ALL {
                chunks.push(AnalysisChunk::new(chunks.len(), &doc.url, piece.clone(), cap));
            }
        }
    }
    chunks
}

/// Split at whitespace into pieces of at most `limit` chars.
/// A single word longer than `limit` is cut hard.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut cur_len = 0usize;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > limit {
            if cur_len > 0 {
                out.push(std::mem::take(&mut cur));
                cur_len = 0;
            }
            let rest = word.split_off(limit);
            out.push(word.into_iter().collect());
            word = rest;
        }
        let wlen = word.len();
        if wlen == 0 {
            continue;
        }
        let needed = if cur_len == 0 { wlen } else { cur_len + 1 + wlen };
        if needed > limit {
            out.push(std::mem::take(&mut cur));
            cur_len = 0;
        }
        if cur_len > 0 {
            cur.push(' ');
            cur_len += 1;
        }
        cur.extend(word);
        cur_len += wlen;
    }
    if cur_len > 0 {
        out.push(cur);
    }
    out
}
