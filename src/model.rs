//! Core data model: runs, documents, chunks, reports and progress snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AnalysisError, FailureReason};

pub const MAX_NICHE_CHARS: usize = 200;
pub const MAX_DESCRIPTION_CHARS: usize = 2000;

/// Opaque, unique run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Fan-out knob. Changes breadth only, never algorithm logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthTier {
    Low,
    Medium,
    High,
}

impl DepthTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for DepthTier {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(AnalysisError::Validation(format!(
                "depth must be one of low|medium|high, got '{other}'"
            ))),
        }
    }
}

/// What the caller asked to research.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub niche: String,
    #[serde(default)]
    pub description: Option<String>,
    pub depth: DepthTier,
}

impl InputSpec {
    pub fn new(niche: impl Into<String>, depth: DepthTier) -> Self {
        Self {
            niche: niche.into(),
            description: None,
            depth,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Trim fields and reject empty/oversized input.
    pub fn validated(mut self) -> Result<Self, AnalysisError> {
        self.niche = self.niche.trim().to_string();
        if self.niche.is_empty() {
            return Err(AnalysisError::Validation("niche must not be empty".into()));
        }
        if self.niche.chars().count() > MAX_NICHE_CHARS {
            return Err(AnalysisError::Validation(format!(
                "niche must be at most {MAX_NICHE_CHARS} characters"
            )));
        }
        self.description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if let Some(d) = &self.description {
            if d.chars().count() > MAX_DESCRIPTION_CHARS {
                return Err(AnalysisError::Validation(format!(
                    "description must be at most {MAX_DESCRIPTION_CHARS} characters"
                )));
            }
        }
        Ok(self)
    }
}

/// Pipeline stage. Ordering of variants is the only legal direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Collecting,
    Analyzing,
    Synthesizing,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Legal transitions: the next stage in line, or `Failed` from any non-terminal stage.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Collecting => *self == Self::Pending,
            Self::Analyzing => *self == Self::Collecting,
            Self::Synthesizing => *self == Self::Analyzing,
            Self::Done => *self == Self::Synthesizing,
            Self::Pending => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    PartiallyFailed,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One end-to-end execution of the pipeline for one input spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: RunId,
    pub input: InputSpec,
    pub stage: Stage,
    pub status: RunStatus,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every mutation; stores use it to drop stale writes.
    pub revision: u64,
    #[serde(default)]
    pub documents_ok: usize,
    #[serde(default)]
    pub documents_failed: usize,
    #[serde(default)]
    pub chunks_total: usize,
    #[serde(default)]
    pub chunks_succeeded: usize,
    #[serde(default)]
    pub chunks_exhausted: usize,
}

impl AnalysisRun {
    pub fn new(input: InputSpec) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            input,
            stage: Stage::Pending,
            status: RunStatus::Pending,
            failure: None,
            created_at: now,
            updated_at: now,
            revision: 1,
            documents_ok: 0,
            documents_failed: 0,
            chunks_total: 0,
            chunks_succeeded: 0,
            chunks_exhausted: 0,
        }
    }

    /// Move to `next`. Returns `false` (and changes nothing) on an illegal transition.
    pub fn advance(&mut self, next: Stage) -> bool {
        if !self.stage.can_advance_to(next) {
            return false;
        }
        self.stage = next;
        match next {
            Stage::Done => self.status = RunStatus::Completed,
            Stage::Failed => self.status = RunStatus::Failed,
            _ if self.status == RunStatus::Pending => self.status = RunStatus::Running,
            _ => {}
        }
        self.touch();
        true
    }

    pub fn fail(&mut self, reason: FailureReason) -> bool {
        if self.advance(Stage::Failed) {
            self.failure = Some(reason);
            true
        } else {
            false
        }
    }

    /// Record that some partial failure was absorbed.
    pub fn mark_degraded(&mut self) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::PartiallyFailed;
            self.touch();
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Timeout,
    Error,
}

/// One fetched source. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub url: String,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub query: String,
}

impl SourceDocument {
    pub fn ok(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
            fetched_at: Utc::now(),
            status: FetchStatus::Ok,
            error: None,
            query: String::new(),
        }
    }

    pub fn failed(url: impl Into<String>, status: FetchStatus, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: String::new(),
            fetched_at: Utc::now(),
            status,
            error: Some(error.into()),
            query: String::new(),
        }
    }

    pub fn for_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }

    /// `ok` status with non-blank content.
    pub fn is_usable(&self) -> bool {
        self.status == FetchStatus::Ok && !self.content.trim().is_empty()
    }
}

/// Analytical function requested from a provider.
/// Declaration order is the canonical report section order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Sentiment,
    EntityExtraction,
    TopicModeling,
    Summarization,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Sentiment,
        Capability::EntityExtraction,
        Capability::TopicModeling,
        Capability::Summarization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sentiment => "sentiment",
            Self::EntityExtraction => "entity_extraction",
            Self::TopicModeling => "topic_modeling",
            Self::Summarization => "summarization",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Sentiment => "Sentiment",
            Self::EntityExtraction => "Entities",
            Self::TopicModeling => "Topics",
            Self::Summarization => "Summary",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sentiment" => Ok(Self::Sentiment),
            "entity_extraction" | "entities" => Ok(Self::EntityExtraction),
            "topic_modeling" | "topics" => Ok(Self::TopicModeling),
            "summarization" | "summary" => Ok(Self::Summarization),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Succeeded,
    Exhausted,
}

/// One unit of AI work: one capability applied to one piece of source content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisChunk {
    pub index: usize,
    pub source_url: String,
    pub input: String,
    pub capability: Capability,
    pub result: Option<String>,
    pub provider: Option<String>,
    pub attempts: u32,
    pub status: ChunkStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl AnalysisChunk {
    pub fn new(index: usize, source_url: &str, input: String, capability: Capability) -> Self {
        Self {
            index,
            source_url: source_url.to_string(),
            input,
            capability,
            result: None,
            provider: None,
            attempts: 0,
            status: ChunkStatus::Pending,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ChunkStatus::Pending
    }
}

/// One report section per capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub capability: Capability,
    pub title: String,
    pub findings: Vec<String>,
    pub chunks_attempted: usize,
    pub chunks_succeeded: usize,
}

/// A source cited by the report, with its reliability score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub url: String,
    pub reliability: f32,
    pub confidence: String,
}

/// Final per-run report. Built once by the synthesize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub run_id: RunId,
    pub niche: String,
    pub sections: Vec<ReportSection>,
    pub narrative: String,
    pub sources: Vec<SourceCitation>,
    /// Partial-failure notes (failed sources, exhausted chunks).
    pub notes: Vec<String>,
    /// Present when the report went through a verification pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationSummary>,
    pub generated_at: DateTime<Utc>,
}

/// Reviewer answer for one verified report item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    /// No usable answer: every provider failed or the reply had no verdict.
    Error,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::Rejected => "rejected",
            Verdict::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedItem {
    /// Section title, or `Narrative`.
    pub label: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Outcome of the verification pass over a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub items: Vec<VerifiedItem>,
    pub approved: usize,
    pub rejected: usize,
    pub errors: usize,
    /// Approved share of verified items, 0..=100.
    pub quality_score: f32,
}

impl VerificationSummary {
    pub fn from_items(items: Vec<VerifiedItem>) -> Self {
        let tally = |v: Verdict| items.iter().filter(|i| i.verdict == v).count();
        let approved = tally(Verdict::Approved);
        let rejected = tally(Verdict::Rejected);
        let errors = tally(Verdict::Error);
        let quality_score = if items.is_empty() {
            0.0
        } else {
            (approved as f32 / items.len() as f32 * 100.0 * 10.0).round() / 10.0
        };
        Self {
            items,
            approved,
            rejected,
            errors,
            quality_score,
        }
    }
}

/// What observers see for a run at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: RunId,
    pub stage: Stage,
    pub status: RunStatus,
    /// 0..=100, never decreases for a given run.
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub documents_ok: usize,
    pub documents_failed: usize,
    pub chunks_total: usize,
    pub chunks_succeeded: usize,
    pub chunks_exhausted: usize,
    pub failure: Option<FailureReason>,
    /// True once any document or chunk failure has been absorbed.
    pub degraded: bool,
}

impl ProgressSnapshot {
    pub fn pending(run_id: RunId) -> Self {
        Self {
            run_id,
            stage: Stage::Pending,
            status: RunStatus::Pending,
            percent: 0,
            message: "queued".to_string(),
            timestamp: Utc::now(),
            documents_ok: 0,
            documents_failed: 0,
            chunks_total: 0,
            chunks_succeeded: 0,
            chunks_exhausted: 0,
            failure: None,
            degraded: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
