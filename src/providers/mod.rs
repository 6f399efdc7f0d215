//! Provider Pool: ranked AI backends with per-provider health.
//!
//! - `acquire` lists eligible providers for a capability, best first.
//! - `execute` performs one call with a timeout and never retries.
//! - `report` folds the outcome into that provider's health record.
//! - `complete` is the dispatch helper: walk the eligible list until one succeeds.
//!
//! The table layout is fixed at construction. Each record sits behind its own
//! mutex, so concurrent workers from any run serialize per provider only.

pub mod backend;
pub mod health;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::config::{HealthPolicy, ProviderSpec};
use crate::error::ProviderError;
use crate::model::Capability;

pub use backend::{
    build_backend, AiBackend, CompletionFuture, CompletionRequest, DynBackend, MockBackend,
    OpenAiCompatBackend,
};
pub use health::{HealthState, Outcome, ProviderRecord};

/// Eligible provider as returned by `acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRef {
    pub name: String,
    pub rank: u32,
}

/// Successful dispatch of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub provider: String,
    pub attempts: u32,
}

/// Every eligible provider failed (or the walk was cancelled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
    pub last_error: Option<ProviderError>,
    pub cancelled: bool,
}

struct PoolEntry {
    name: String,
    backend: DynBackend,
    record: Mutex<ProviderRecord>,
}

pub struct ProviderPool {
    entries: Vec<PoolEntry>,
    policy: HealthPolicy,
}

impl ProviderPool {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    /// Register a backend. Duplicate names replace the earlier entry.
    pub fn with_provider(
        mut self,
        name: &str,
        rank: u32,
        capabilities: &[Capability],
        backend: DynBackend,
    ) -> Self {
        let name = name.trim().to_ascii_lowercase();
        self.entries.retain(|e| e.name != name);
        self.entries.push(PoolEntry {
            name: name.clone(),
            backend,
            record: Mutex::new(ProviderRecord::new(&name, rank, capabilities.to_vec())),
        });
        self
    }

    /// Build from config; disabled specs are skipped.
    pub fn from_specs(specs: &[ProviderSpec], policy: HealthPolicy) -> anyhow::Result<Self> {
        let mut pool = Self::new(policy);
        for spec in specs.iter().filter(|s| s.enabled) {
            let backend = build_backend(spec)?;
            info!(
                target: "pool",
                provider = %spec.name,
                rank = spec.rank,
                kind = backend.kind(),
                "provider registered"
            );
            pool = pool.with_provider(&spec.name, spec.rank, &spec.capabilities, backend);
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Snapshot of the health table, in registration order.
    pub fn records(&self) -> Vec<ProviderRecord> {
        self.entries
            .iter()
            .map(|e| lock_record(&e.record).clone())
            .collect()
    }

    pub fn record(&self, name: &str) -> Option<ProviderRecord> {
        self.entry(name).map(|e| lock_record(&e.record).clone())
    }

    pub fn acquire(&self, capability: Capability) -> Vec<ProviderRef> {
        self.acquire_at(capability, Utc::now())
    }

    /// Eligible providers for `capability` at `now`, ordered by rank, then fewest
    /// consecutive failures, then name.
    pub fn acquire_at(&self, capability: Capability, now: DateTime<Utc>) -> Vec<ProviderRef> {
        let mut out: Vec<(u32, u32, String)> = Vec::new();
        for e in &self.entries {
            let mut rec = lock_record(&e.record);
            if !rec.supports(capability) || !rec.is_eligible(now) {
                continue;
            }
            if rec.health == HealthState::Suspended {
                // Suspension window elapsed: half-open until the next outcome.
                rec.health = HealthState::Degraded;
                debug!(target: "pool", provider = %rec.name, "suspension elapsed, probing");
            }
            out.push((rec.rank, rec.consecutive_failures, rec.name.clone()));
        }
        out.sort();
        out.into_iter()
            .map(|(rank, _, name)| ProviderRef { name, rank })
            .collect()
    }

    /// One call against one provider with an explicit timeout. Never retries.
    pub async fn execute(
        &self,
        provider: &str,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let Some(entry) = self.entry(provider) else {
            return Err(ProviderError::Unavailable(format!(
                "unknown provider '{provider}'"
            )));
        };
        let t0 = Instant::now();
        let res = match tokio::time::timeout(timeout, entry.backend.complete(request)).await {
            Ok(Err(ProviderError::Timeout(_))) | Err(_) => Err(ProviderError::Timeout(timeout)),
            Ok(other) => other,
        };
        histogram!("provider_call_ms", "provider" => provider.to_string())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        res
    }

    pub fn report(&self, provider: &str, outcome: &Outcome) {
        self.report_at(provider, outcome, Utc::now())
    }

    /// Fold an outcome into the provider's record under its lock.
    pub fn report_at(&self, provider: &str, outcome: &Outcome, now: DateTime<Utc>) {
        let Some(entry) = self.entry(provider) else {
            return;
        };
        let label = match outcome {
            Outcome::Success => "success",
            Outcome::Failure(e) => e.kind(),
        };
        counter!("provider_calls_total", "provider" => provider.to_string(), "outcome" => label)
            .increment(1);

        let mut rec = lock_record(&entry.record);
        let suspended = rec.apply(outcome, &self.policy, now);
        if suspended {
            counter!("provider_suspensions_total", "provider" => provider.to_string())
                .increment(1);
            warn!(
                target: "pool",
                provider = %rec.name,
                reason = label,
                failures = rec.consecutive_failures,
                until = ?rec.suspend_until,
                "provider suspended"
            );
        } else if let Outcome::Failure(e) = outcome {
            debug!(target: "pool", provider = %rec.name, error = %e, "provider call failed");
        }
    }

    /// Clear an auth suspension once credentials have been fixed. The backend
    /// gets its rejected keys back too.
    pub fn reinstate(&self, provider: &str) -> bool {
        match self.entry(provider) {
            Some(e) => {
                e.backend.reset_credentials();
                lock_record(&e.record).reinstate();
                info!(target: "pool", provider, "provider reinstated");
                true
            }
            None => false,
        }
    }

    /// Walk the eligible providers for `request.capability` until one succeeds.
    /// Every outcome is reported. Stops before the next attempt once `cancel` is set.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<Completion, Exhausted> {
        let candidates = self.acquire(request.capability);
        let mut attempts = 0u32;
        let mut last_error = None;

        for candidate in candidates {
            if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                return Err(Exhausted {
                    attempts,
                    last_error,
                    cancelled: true,
                });
            }
            // Another worker may have suspended it since `acquire`.
            if !self.is_eligible(&candidate.name, Utc::now()) {
                continue;
            }
            attempts += 1;
            match self.execute(&candidate.name, request, timeout).await {
                Ok(text) => {
                    self.report(&candidate.name, &Outcome::Success);
                    return Ok(Completion {
                        text,
                        provider: candidate.name,
                        attempts,
                    });
                }
                Err(e) => {
                    self.report(&candidate.name, &Outcome::Failure(e.clone()));
                    last_error = Some(e);
                }
            }
        }

        Err(Exhausted {
            attempts,
            last_error,
            cancelled: false,
        })
    }

    fn is_eligible(&self, provider: &str, now: DateTime<Utc>) -> bool {
        self.entry(provider)
            .map(|e| lock_record(&e.record).is_eligible(now))
            .unwrap_or(false)
    }

    fn entry(&self, provider: &str) -> Option<&PoolEntry> {
        self.entries.iter().find(|e| e.name == provider)
    }
}

/// A poisoned record is still a valid record: every mutation is a single `apply`.
fn lock_record(m: &Mutex<ProviderRecord>) -> std::sync::MutexGuard<'_, ProviderRecord> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
