//! AI backends: the low-level "complete this prompt" capability behind each provider.
//!
//! A backend does exactly one remote call per `complete` and never retries; rotation,
//! fallback and health bookkeeping belong to the pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::ProviderSpec;
use crate::error::ProviderError;
use crate::model::Capability;

/// Responses longer than this are cut (on a char boundary).
pub const MAX_RESPONSE_CHARS: usize = 6_000;

/// What we ask a backend to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub capability: Capability,
    pub system: String,
    pub prompt: String,
}

pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>>;

/// One interchangeable AI backend.
pub trait AiBackend: Send + Sync + 'static {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a>;
    /// Backend flavour for diagnostics ("openai", "mock", ...).
    fn kind(&self) -> &'static str;
    /// Forget credentials rejected so far. Called when the provider is reinstated.
    fn reset_credentials(&self) {}
}

pub type DynBackend = Arc<dyn AiBackend>;

/// Build a backend according to its provider spec.
pub fn build_backend(spec: &ProviderSpec) -> anyhow::Result<DynBackend> {
    match spec.kind {
        crate::config::BackendKind::Openai => {
            // No key is not fatal: the first call fails with AuthError and the
            // pool suspends the provider until it is reinstated.
            let keys = spec.resolve_api_keys();
            if keys.is_empty() {
                tracing::warn!(target: "pool", provider = %spec.name, env = %spec.api_key_env_var(), "api key unavailable");
            }
            Ok(Arc::new(OpenAiCompatBackend::new(
                &spec.base_url,
                &spec.model,
                keys,
                spec.max_tokens,
                spec.temperature,
            )?))
        }
        crate::config::BackendKind::Mock => Ok(Arc::new(MockBackend::echo(&spec.name))),
    }
}

// ------------------------------------------------------------
// OpenAI-compatible chat completions
// ------------------------------------------------------------

struct ApiKey {
    secret: String,
    revoked: AtomicBool,
}

/// Any endpoint speaking the OpenAI chat-completions dialect.
///
/// Calls rotate round-robin over the configured keys. A key answered with
/// 401/403 is revoked and the same call moves on to the next live key; only when
/// none is left does the call fail with `AuthError`.
pub struct OpenAiCompatBackend {
    http: reqwest::Client,
    endpoint: String,
    keys: Vec<ApiKey>,
    next_key: AtomicUsize,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        api_keys: Vec<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("niche-market-analyzer/0.1")
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            keys: api_keys
                .into_iter()
                .filter(|k| !k.trim().is_empty())
                .map(|secret| ApiKey {
                    secret,
                    revoked: AtomicBool::new(false),
                })
                .collect(),
            next_key: AtomicUsize::new(0),
            model: model.to_string(),
            max_tokens,
            temperature,
        })
    }

    /// Keys not yet rejected.
    pub fn live_keys(&self) -> usize {
        self.keys
            .iter()
            .filter(|k| !k.revoked.load(Ordering::SeqCst))
            .count()
    }

    async fn complete_impl(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let n = self.keys.len();
        if n == 0 {
            return Err(ProviderError::AuthError("missing api key".into()));
        }
        let start = self.next_key.fetch_add(1, Ordering::SeqCst) % n;
        let mut rejected = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let key = &self.keys[idx];
            if key.revoked.load(Ordering::SeqCst) {
                continue;
            }
            match self.send(request, &key.secret).await {
                Err(ProviderError::AuthError(msg)) => {
                    key.revoked.store(true, Ordering::SeqCst);
                    tracing::warn!(target: "pool", key_index = idx, error = %msg, "api key rejected, rotating");
                    rejected = Some(msg);
                }
                other => return other,
            }
        }
        Err(ProviderError::AuthError(match rejected {
            Some(msg) => format!("every api key rejected ({msg})"),
            None => "every api key rejected".into(),
        }))
    }

    async fn send(&self, request: &CompletionRequest, api_key: &str) -> Result<String, ProviderError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &request.system,
                },
                Msg {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(Duration::ZERO)
                } else {
                    ProviderError::Unavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::AuthError(format!("http {}", status.as_u16())));
        }
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!("http {}", status.as_u16())));
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        non_empty(sanitize_response(&content))
    }
}

impl AiBackend for OpenAiCompatBackend {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(self.complete_impl(request))
    }
    fn kind(&self) -> &'static str {
        "openai"
    }
    fn reset_credentials(&self) {
        for k in &self.keys {
            k.revoked.store(false, Ordering::SeqCst);
        }
    }
}

// ------------------------------------------------------------
// Mock backend
// ------------------------------------------------------------

#[derive(Debug, Clone)]
enum MockMode {
    Echo,
    Fixed(String),
    Fail(ProviderError),
}

/// Deterministic backend for tests and local runs. Counts its calls.
#[derive(Clone)]
pub struct MockBackend {
    label: String,
    mode: MockMode,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Answers `"[label] capability: <start of the prompt>"`.
    pub fn echo(label: &str) -> Self {
        Self {
            label: label.to_string(),
            mode: MockMode::Echo,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fixed(label: &str, text: &str) -> Self {
        Self {
            mode: MockMode::Fixed(text.to_string()),
            ..Self::echo(label)
        }
    }

    pub fn failing(label: &str, err: ProviderError) -> Self {
        Self {
            mode: MockMode::Fail(err),
            ..Self::echo(label)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared counter, still readable after the backend moved into a pool.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl AiBackend for MockBackend {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            match &self.mode {
                MockMode::Echo => {
                    let head: String = request.prompt.chars().take(60).collect();
                    non_empty(sanitize_response(&format!(
                        "[{}] {}: {}",
                        self.label, request.capability, head
                    )))
                }
                MockMode::Fixed(text) => non_empty(sanitize_response(text)),
                MockMode::Fail(err) => Err(err.clone()),
            }
        })
    }
    fn kind(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Sanitization
// ------------------------------------------------------------

fn non_empty(s: String) -> Result<String, ProviderError> {
    if s.is_empty() {
        Err(ProviderError::InvalidResponse("empty completion".into()))
    } else {
        Ok(s)
    }
}

/// Strip control characters (keeping newlines), collapse runs of blanks, cap the length.
pub fn sanitize_response(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_RESPONSE_CHARS));
    let mut prev_space = false;
    for (count, ch) in input.chars().enumerate() {
        if count >= MAX_RESPONSE_CHARS {
            break;
        }
        let c = match ch {
            '\n' => '\n',
            '\r' | '\t' => ' ',
            c if c.is_control() => ' ',
            c => c,
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out.trim().to_string()
}
