//! Prompt templates, one per capability.

use crate::model::{Capability, InputSpec, Verdict};
use crate::providers::CompletionRequest;

const SYSTEM: &str = "You are a market research analyst. Work only from the provided source text. \
Be concise and factual, no emojis, no preamble. If the text holds nothing relevant, answer exactly: NONE.";

fn instruction(capability: Capability) -> &'static str {
    match capability {
        Capability::Sentiment => {
            "Classify the overall sentiment of this text toward the niche as positive, negative, \
             neutral or mixed, then give one sentence of justification."
        }
        Capability::EntityExtraction => {
            "List the companies, products, brands, people and communities mentioned that matter \
             for this niche, one per line as `name - role`."
        }
        Capability::TopicModeling => {
            "List the 3 to 5 main topics or themes this text raises about the niche, one per line."
        }
        Capability::Summarization => {
            "Summarize what this text says about the niche's market, audience, demand and \
             competition in at most 4 sentences."
        }
    }
}

fn niche_line(input: &InputSpec) -> String {
    match &input.description {
        Some(d) => format!("Niche: {}\nContext: {}", input.niche, d),
        None => format!("Niche: {}", input.niche),
    }
}

/// Request for one chunk of source text.
pub fn chunk_request(input: &InputSpec, capability: Capability, text: &str) -> CompletionRequest {
    CompletionRequest {
        capability,
        system: SYSTEM.to_string(),
        prompt: format!(
            "{}\nTask: {}\n\nSource text:\n\"\"\"\n{}\n\"\"\"",
            niche_line(input),
            instruction(capability),
            text
        ),
    }
}

/// Request for the merged narrative over all section findings.
pub fn narrative_request(input: &InputSpec, digest: &str) -> CompletionRequest {
    CompletionRequest {
        capability: Capability::Summarization,
        system: SYSTEM.to_string(),
        prompt: format!(
            "{}\nTask: Write a market overview of 2 short paragraphs from the findings below: \
             demand and sentiment first, then key players and open opportunities.\n\nFindings:\n{}",
            niche_line(input),
            digest
        ),
    }
}

const VERIFY_SYSTEM: &str = "You review market research for accuracy. Reject content that is \
generic filler, self-contradictory, off-topic for the niche or states figures without support. \
Answer on the first line with exactly APPROVED or REJECTED, then one sentence of reason.";

/// Request asking a reviewer model to approve or reject one report item.
pub fn verify_request(input: &InputSpec, label: &str, text: &str) -> CompletionRequest {
    CompletionRequest {
        capability: Capability::Summarization,
        system: VERIFY_SYSTEM.to_string(),
        prompt: format!(
            "{}\nItem: {}\n\nContent:\n\"\"\"\n{}\n\"\"\"",
            niche_line(input),
            label,
            text
        ),
    }
}

/// Verdict from the reply's first word; the rest of the first line is the reason.
pub fn parse_verdict(reply: &str) -> (Verdict, Option<String>) {
    let line = reply.trim().lines().next().unwrap_or("").trim();
    let (head, rest) = line
        .split_once(|c: char| c.is_whitespace() || c == ':' || c == '-' || c == '.')
        .unwrap_or((line, ""));
    let verdict = match head.to_ascii_uppercase().as_str() {
        "APPROVED" => Verdict::Approved,
        "REJECTED" => Verdict::Rejected,
        _ => return (Verdict::Error, Some(format!("unparseable verdict: {line}"))),
    };
    let mut reason = rest
        .trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '-' || c == '.')
        .trim()
        .to_string();
    if reason.is_empty() {
        reason = reply.trim().lines().nth(1).unwrap_or("").trim().to_string();
    }
    (verdict, (!reason.is_empty()).then_some(reason))
}

/// Models answer NONE when a chunk had nothing relevant.
pub fn is_empty_answer(text: &str) -> bool {
    text.trim().trim_end_matches('.').eq_ignore_ascii_case("none")
}
