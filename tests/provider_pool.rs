// tests/provider_pool.rs
//
// Provider pool health behaviour as seen through its public API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use niche_market_analyzer::config::HealthPolicy;
use niche_market_analyzer::error::ProviderError;
use niche_market_analyzer::model::Capability;
use niche_market_analyzer::providers::{
    AiBackend, CompletionFuture, CompletionRequest, HealthState, MockBackend, Outcome,
    ProviderPool,
};

fn req() -> CompletionRequest {
    CompletionRequest {
        capability: Capability::Sentiment,
        system: String::new(),
        prompt: "Reviews praise the course".into(),
    }
}

fn two_providers(primary: MockBackend) -> ProviderPool {
    ProviderPool::new(HealthPolicy::default())
        .with_provider("primary", 1, &Capability::ALL, Arc::new(primary))
        .with_provider(
            "secondary",
            2,
            &Capability::ALL,
            Arc::new(MockBackend::echo("secondary")),
        )
}

fn names(pool: &ProviderPool, now: chrono::DateTime<Utc>) -> Vec<String> {
    pool.acquire_at(Capability::Sentiment, now)
        .into_iter()
        .map(|p| p.name)
        .collect()
}

#[tokio::test]
async fn rate_limit_moves_on_without_counting_toward_threshold() {
    let primary = MockBackend::failing(
        "primary",
        ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        },
    );
    let pool = two_providers(primary);

    let done = pool
        .complete(&req(), Duration::from_secs(1), None)
        .await
        .unwrap();
    assert_eq!(done.provider, "secondary");

    let rec = pool.record("primary").unwrap();
    assert_eq!(rec.consecutive_failures, 0);
    assert_ne!(rec.health, HealthState::Suspended);
    assert!(rec.cooldown_until.is_some());
    // Cooling down: not offered again right away.
    assert_eq!(names(&pool, Utc::now()), vec!["secondary"]);
}

#[test]
fn threshold_suspends_then_window_reopens_with_growing_backoff() {
    let pool = two_providers(MockBackend::echo("primary"));
    let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
    let fail = Outcome::Failure(ProviderError::Unavailable("502".into()));

    pool.report_at("primary", &fail, t0);
    pool.report_at("primary", &fail, t0);
    assert_eq!(names(&pool, t0), vec!["primary", "secondary"]);
    pool.report_at("primary", &fail, t0);
    assert_eq!(names(&pool, t0), vec!["secondary"]);

    // Default base backoff is 30s.
    let t1 = t0 + ChronoDuration::seconds(29);
    assert_eq!(names(&pool, t1), vec!["secondary"]);
    let t2 = t0 + ChronoDuration::seconds(30);
    assert_eq!(names(&pool, t2), vec!["primary", "secondary"]);

    // Half-open attempt fails: suspended again, window doubles.
    pool.report_at("primary", &fail, t2);
    let rec = pool.record("primary").unwrap();
    assert_eq!(rec.health, HealthState::Suspended);
    assert_eq!(rec.suspend_until, Some(t2 + ChronoDuration::seconds(60)));

    // Success resets everything.
    let t3 = t2 + ChronoDuration::seconds(60);
    assert_eq!(names(&pool, t3).first().map(String::as_str), Some("primary"));
    pool.report_at("primary", &Outcome::Success, t3);
    let rec = pool.record("primary").unwrap();
    assert_eq!(rec.health, HealthState::Healthy);
    assert_eq!(rec.consecutive_failures, 0);
    assert_eq!(rec.suspensions, 0);
}

#[tokio::test]
async fn auth_suspension_lasts_until_reinstated() {
    let pool = two_providers(MockBackend::failing(
        "primary",
        ProviderError::AuthError("bad key".into()),
    ));
    pool.complete(&req(), Duration::from_secs(1), None)
        .await
        .unwrap();

    let far_future = Utc::now() + ChronoDuration::days(365);
    assert_eq!(names(&pool, far_future), vec!["secondary"]);
    assert!(pool.record("primary").unwrap().is_auth_suspended());

    assert!(pool.reinstate("primary"));
    assert_eq!(names(&pool, Utc::now()), vec!["primary", "secondary"]);
    assert!(!pool.reinstate("nobody"));
}

/// Rejects every call until its credentials are reset.
struct RevokedKeys {
    resets: Arc<std::sync::atomic::AtomicUsize>,
}

impl AiBackend for RevokedKeys {
    fn complete<'a>(&'a self, _request: &'a CompletionRequest) -> CompletionFuture<'a> {
        Box::pin(async move {
            if self.resets.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(ProviderError::AuthError("every api key rejected".into()))
            } else {
                Ok("fresh key works".to_string())
            }
        })
    }
    fn kind(&self) -> &'static str {
        "revoked"
    }
    fn reset_credentials(&self) {
        self.resets.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test]
async fn reinstate_gives_the_backend_its_keys_back() {
    let resets = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let pool = ProviderPool::new(HealthPolicy::default()).with_provider(
        "keyed",
        1,
        &Capability::ALL,
        Arc::new(RevokedKeys {
            resets: resets.clone(),
        }),
    );
    assert!(pool.complete(&req(), Duration::from_secs(1), None).await.is_err());
    assert!(pool.record("keyed").unwrap().is_auth_suspended());

    assert!(pool.reinstate("keyed"));
    assert_eq!(resets.load(std::sync::atomic::Ordering::SeqCst), 1);
    let done = pool.complete(&req(), Duration::from_secs(1), None).await.unwrap();
    assert_eq!(done.text, "fresh key works");
}

#[tokio::test]
async fn exhausted_when_every_provider_fails() {
    let pool = ProviderPool::new(HealthPolicy::default())
        .with_provider(
            "a",
            1,
            &Capability::ALL,
            Arc::new(MockBackend::failing("a", ProviderError::Unavailable("x".into()))),
        )
        .with_provider(
            "b",
            2,
            &Capability::ALL,
            Arc::new(MockBackend::fixed("b", "   ")),
        );
    let ex = pool
        .complete(&req(), Duration::from_secs(1), None)
        .await
        .unwrap_err();
    assert_eq!(ex.attempts, 2);
    assert!(!ex.cancelled);
    assert!(matches!(ex.last_error, Some(ProviderError::InvalidResponse(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reports_keep_counts_consistent() {
    let mut policy = HealthPolicy::default();
    policy.failure_threshold = 1_000;
    let pool = Arc::new(ProviderPool::new(policy).with_provider(
        "p",
        1,
        &Capability::ALL,
        Arc::new(MockBackend::echo("p")),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                pool.report(
                    "p",
                    &Outcome::Failure(ProviderError::Timeout(Duration::from_secs(1))),
                );
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let rec = pool.record("p").unwrap();
    assert_eq!(rec.total_failures, 400);
    assert_eq!(rec.consecutive_failures, 400);
}
