// src/config/mod.rs
pub mod orchestrator;
pub mod providers;

pub use orchestrator::{
    load_config_default, load_config_from, DepthProfile, DepthProfiles, HealthPolicy,
    OrchestratorConfig, SourcesConfig, ENV_CONFIG_PATH,
};
pub use providers::{BackendKind, ProviderSpec};
