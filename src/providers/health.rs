//! Provider health record and its state transitions.
//!
//! Pure logic over explicit timestamps so tests can drive the clock.
//! The pool serializes all mutation of one record behind that record's lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HealthPolicy;
use crate::error::ProviderError;
use crate::model::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Suspended,
}

/// What happened on one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(ProviderError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub name: String,
    pub rank: u32,
    pub capabilities: Vec<Capability>,
    pub health: HealthState,
    pub consecutive_failures: u32,
    /// Suspensions since the last success; drives exponential backoff.
    pub suspensions: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// End of the current suspension. `None` while suspended means indefinite (auth).
    pub suspend_until: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl ProviderRecord {
    pub fn new(name: &str, rank: u32, capabilities: Vec<Capability>) -> Self {
        Self {
            name: name.to_string(),
            rank,
            capabilities,
            health: HealthState::Healthy,
            consecutive_failures: 0,
            suspensions: 0,
            last_failure_at: None,
            suspend_until: None,
            cooldown_until: None,
            total_successes: 0,
            total_failures: 0,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Suspended with no end time: only `reinstate` brings it back.
    pub fn is_auth_suspended(&self) -> bool {
        self.health == HealthState::Suspended && self.suspend_until.is_none()
    }

    /// Eligible at `now`: not suspended (or suspension elapsed) and not cooling down.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.health == HealthState::Suspended {
            match self.suspend_until {
                None => return false,
                Some(until) if now < until => return false,
                Some(_) => {}
            }
        }
        !matches!(self.cooldown_until, Some(until) if now < until)
    }

    /// Fold one outcome into the record. Returns `true` if this call suspended the provider.
    pub fn apply(&mut self, outcome: &Outcome, policy: &HealthPolicy, now: DateTime<Utc>) -> bool {
        match outcome {
            Outcome::Success => {
                self.total_successes += 1;
                self.consecutive_failures = 0;
                self.suspensions = 0;
                self.suspend_until = None;
                self.cooldown_until = None;
                self.health = HealthState::Healthy;
                false
            }
            Outcome::Failure(err) => {
                self.total_failures += 1;
                self.last_failure_at = Some(now);
                match err {
                    ProviderError::AuthError(_) => {
                        self.health = HealthState::Suspended;
                        self.suspend_until = None;
                        true
                    }
                    ProviderError::RateLimited { retry_after } => {
                        let cooldown = retry_after
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(policy.rate_limit_cooldown_ms)
                            .min(policy.rate_limit_cooldown_ms.max(1));
                        self.cooldown_until =
                            Some(now + ChronoDuration::milliseconds(cooldown as i64));
                        false
                    }
                    _ => {
                        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                        if self.consecutive_failures >= policy.failure_threshold {
                            self.suspensions = self.suspensions.saturating_add(1);
                            let backoff = policy.backoff_for(self.suspensions);
                            self.health = HealthState::Suspended;
                            self.suspend_until =
                                Some(now + ChronoDuration::milliseconds(backoff.as_millis() as i64));
                            true
                        } else {
                            if self.health == HealthState::Healthy {
                                self.health = HealthState::Degraded;
                            }
                            false
                        }
                    }
                }
            }
        }
    }

    /// Clear an indefinite (auth) suspension after reconfiguration.
    pub fn reinstate(&mut self) {
        self.health = HealthState::Healthy;
        self.consecutive_failures = 0;
        self.suspensions = 0;
        self.suspend_until = None;
        self.cooldown_until = None;
    }
}
