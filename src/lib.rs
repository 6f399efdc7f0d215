// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod source_weights;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::OrchestratorConfig;
pub use crate::error::{AnalysisError, FailureReason, ProviderError};
pub use crate::model::{
    AnalysisRun, Capability, DepthTier, InputSpec, ProgressSnapshot, ReportArtifact, RunId,
    RunStatus, Stage,
};
pub use crate::orchestrator::Orchestrator;
