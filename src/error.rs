//! Error taxonomy for the orchestration core.
//!
//! Two layers:
//! - [`ProviderError`]: what a single AI backend call can fail with. These are
//!   absorbed by the dispatch loop and only feed provider health.
//! - [`AnalysisError`]: what callers of the orchestrator (or the stage gates)
//!   observe at run level.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::RunId;

/// Failure of one provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The call did not finish within its timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The provider throttled us. Skip to the next provider; only a short cool-down applies.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Empty, undecodable or otherwise unusable response body.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Credentials rejected. The provider stays suspended until reinstated.
    #[error("auth error: {0}")]
    AuthError(String),

    /// Transport failure or 5xx.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Short stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidResponse(_) => "invalid_response",
            Self::AuthError(_) => "auth_error",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Whether this failure counts toward the consecutive-failure threshold.
    pub fn counts_toward_threshold(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::InvalidResponse(_) | Self::Unavailable(_)
        )
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoData,
    InsufficientAnalysis,
    Cancelled,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoData => "no_data",
            Self::InsufficientAnalysis => "insufficient_analysis",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Run-level errors surfaced by the orchestrator and the stage gates.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    /// Bad input spec; rejected at `start`, never enters the pipeline.
    #[error("validation error: {0}")]
    Validation(String),

    /// Every fetch for one query failed. Absorbed by the collect stage.
    #[error("all sources unavailable for query '{query}'")]
    SourceUnavailable { query: String },

    /// Collect produced zero usable documents.
    #[error("no usable documents were collected")]
    NoData,

    /// All eligible providers failed for one chunk.
    #[error("all providers failed for {capability} (attempts: {attempts})")]
    ProviderFailure { capability: String, attempts: u32 },

    /// Chunk success ratio fell below the configured minimum.
    #[error("insufficient analysis: {succeeded}/{total} chunks succeeded (minimum ratio {min_ratio:.2})")]
    InsufficientAnalysis {
        succeeded: usize,
        total: usize,
        min_ratio: f64,
    },

    /// The run was cancelled on request.
    #[error("run cancelled")]
    Cancelled,

    /// A store write failed. The stored run is whatever was last durably written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Unknown or expired run identifier.
    #[error("run {0} not found")]
    NotFound(RunId),

    /// Broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Run failure reason for errors that terminate a run.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::NoData => Some(FailureReason::NoData),
            Self::InsufficientAnalysis { .. } => Some(FailureReason::InsufficientAnalysis),
            Self::Cancelled => Some(FailureReason::Cancelled),
            Self::Internal(_) => Some(FailureReason::Internal),
            _ => None,
        }
    }
}
