// src/config/providers.rs
use serde::{Deserialize, Serialize};
use std::env;

use crate::model::Capability;

/// Highest `<NAME>_API_KEY_<n>` suffix consulted.
const MAX_NUMBERED_KEYS: usize = 9;

fn default_enabled() -> bool {
    true
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    800
}
fn default_temperature() -> f32 {
    0.2
}
fn default_capabilities() -> Vec<Capability> {
    Capability::ALL.to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Any OpenAI-compatible chat-completions endpoint (OpenAI, OpenRouter, Groq, ...).
    Openai,
    /// Deterministic local backend.
    Mock,
}

/// One configured AI backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    /// Lower rank = tried first.
    pub rank: u32,
    pub kind: BackendKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// "ENV" means: read from `<NAME>_API_KEY` (name upper-cased, dashes → underscores),
    /// plus any of `<NAME>_API_KEY_1` ..= `<NAME>_API_KEY_9` that are set.
    #[serde(default)]
    pub api_key: String,
    /// Further literal keys, rotated with the primary one.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl ProviderSpec {
    pub fn mock(name: &str, rank: u32) -> Self {
        Self {
            name: name.to_string(),
            rank,
            kind: BackendKind::Mock,
            enabled: true,
            capabilities: default_capabilities(),
            base_url: String::new(),
            model: "mock".to_string(),
            api_key: String::new(),
            api_keys: Vec::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    /// Env var consulted when `api_key == "ENV"`.
    pub fn api_key_env_var(&self) -> String {
        format!(
            "{}_API_KEY",
            self.name.trim().to_ascii_uppercase().replace(['-', ' ', '.'], "_")
        )
    }

    /// Resolve the API key, following the "ENV" indirection.
    pub fn resolve_api_key(&self) -> anyhow::Result<String> {
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            let var = self.api_key_env_var();
            return env::var(&var).map_err(|_| anyhow::anyhow!("Missing {var} env var"));
        }
        Ok(self.api_key.clone())
    }

    /// Every usable key in rotation order: primary, numbered env vars, literal extras.
    /// Blank and repeated keys are dropped.
    pub fn resolve_api_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.resolve_api_key().into_iter().collect();
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            let var = self.api_key_env_var();
            keys.extend((1..=MAX_NUMBERED_KEYS).filter_map(|i| env::var(format!("{var}_{i}")).ok()));
        }
        keys.extend(self.api_keys.iter().cloned());

        let mut out: Vec<String> = Vec::with_capacity(keys.len());
        for k in keys {
            let k = k.trim().to_string();
            if !k.is_empty() && !out.contains(&k) {
                out.push(k);
            }
        }
        out
    }

    pub(crate) fn sanitize(&mut self) {
        self.name = self.name.trim().to_ascii_lowercase();
        if self.capabilities.is_empty() {
            self.capabilities = default_capabilities();
        }
        self.capabilities.sort();
        self.capabilities.dedup();
        if !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        self.base_url = self.base_url.trim_end_matches('/').to_string();
    }
}
