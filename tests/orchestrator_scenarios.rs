// tests/orchestrator_scenarios.rs
//
// End-to-end runs through the orchestrator with scripted sources and providers.
//
// Covered:
// - happy path (one section per capability, percent reaches 100)
// - partial source failure still completes, with a note
// - auth failure suspends the top provider at once
// - low chunk success ratio fails the run
// - cancel mid-analyze
// - no usable documents → no_data, nothing dispatched
// - collect progress moves per document
// - report artifact write failure stays visible
// - orchestrator-wide report notes and the verification pass

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use niche_market_analyzer::error::{AnalysisError, FailureReason, ProviderError};
use niche_market_analyzer::model::{Capability, DepthTier, InputSpec, RunStatus, Stage};
use niche_market_analyzer::providers::{HealthState, MockBackend, ProviderPool};

fn spec() -> InputSpec {
    InputSpec::new("productivity courses", DepthTier::Low)
}

#[tokio::test]
async fn all_sources_and_providers_succeed() {
    let mut cfg = test_config();
    cfg.ai_narrative = true;
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    let orch = orchestrator(cfg, pool, StaticFetcher::new(ok_docs(3)));

    let id = orch.start(spec()).await.expect("start");
    let done = finish(&orch, &id).await;

    assert_eq!(done.stage, Stage::Done);
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.percent, 100);
    assert!(!done.degraded);
    assert_eq!(done.documents_ok, 3);
    // Low tier: 8 chunks = 2 pieces × 4 capabilities.
    assert_eq!(done.chunks_total, 8);
    assert_eq!(done.chunks_succeeded, 8);

    let report = orch.report(&id).await.unwrap().expect("report");
    let caps: Vec<Capability> = report.sections.iter().map(|s| s.capability).collect();
    assert_eq!(caps, Capability::ALL.to_vec());
    assert!(report.sections.iter().all(|s| !s.findings.is_empty()));
    assert!(report.narrative.starts_with("[primary] summarization:"));
    assert_eq!(report.sources.len(), 3);
    assert!(report.notes.is_empty());
    assert!(report.verification.is_none());

    let stored = orch.store().load_run(&id).await.unwrap().expect("stored run");
    assert_eq!(stored.stage, Stage::Done);
    assert_eq!(stored.status, RunStatus::Completed);
}

#[tokio::test]
async fn partial_source_timeouts_still_complete_with_note() {
    let docs = vec![timed_out_doc(0), ok_doc(1), timed_out_doc(2)];
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    let orch = orchestrator(test_config(), pool, StaticFetcher::new(docs));

    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;

    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.degraded);
    assert_eq!(done.documents_ok, 1);
    assert_eq!(done.documents_failed, 2);

    let report = orch.report(&id).await.unwrap().unwrap();
    assert!(
        report
            .notes
            .iter()
            .any(|n| n.contains("2 of 3 sources failed")),
        "notes: {:?}",
        report.notes
    );
    assert_eq!(report.sources.len(), 1);
}

#[tokio::test]
async fn auth_error_suspends_top_provider_immediately() {
    let mut cfg = test_config();
    cfg.worker_pool_size = 1;
    let primary = MockBackend::failing("primary", ProviderError::AuthError("401".into()));
    let primary_calls = primary.call_counter();
    let secondary = MockBackend::echo("secondary");
    let secondary_calls = secondary.call_counter();
    let pool = add(add(empty_pool(), "primary", 1, primary), "secondary", 2, secondary);
    let orch = orchestrator(cfg, pool, StaticFetcher::new(ok_docs(3)));

    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;
    assert_eq!(done.status, RunStatus::Completed);

    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(secondary_calls.load(Ordering::SeqCst), 8);
    let rec = orch.pool().record("primary").unwrap();
    assert_eq!(rec.health, HealthState::Suspended);
    assert!(rec.suspend_until.is_none());

    let report = orch.report(&id).await.unwrap().unwrap();
    for section in &report.sections {
        assert!(section
            .findings
            .iter()
            .all(|f| f.starts_with("[secondary]")));
    }
}

#[tokio::test]
async fn low_chunk_success_ratio_is_insufficient() {
    let mut cfg = test_config();
    cfg.depth.low.max_sources = 5;
    cfg.depth.low.max_chunks = 20;
    cfg.health.failure_threshold = 100;
    let pool = add(ProviderPool::new(cfg.health), "flaky", 1, PatternBackend::new(5, 2));
    let orch = orchestrator(cfg, pool, StaticFetcher::new(ok_docs(5)));

    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;

    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failure, Some(FailureReason::InsufficientAnalysis));
    assert_eq!(done.chunks_total, 20);
    assert_eq!(done.chunks_succeeded, 8);
    assert_eq!(done.chunks_exhausted, 12);
    assert!(orch.report(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_mid_analyze_stops_dispatch() {
    let mut cfg = test_config();
    cfg.worker_pool_size = 1;
    cfg.provider_timeout_ms = 10_000;
    let backend = GatedBackend::new();
    let started = backend.started.clone();
    let gate = backend.gate.clone();
    let calls = backend.calls.clone();
    let pool = add(empty_pool(), "gated", 1, backend);
    let orch = orchestrator(cfg, pool, StaticFetcher::new(ok_docs(3)));

    let id = orch.start(spec()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("first chunk dispatched");

    orch.cancel(&id).unwrap();
    gate.notify_one();

    let done = finish(&orch, &id).await;
    assert_eq!(done.stage, Stage::Failed);
    assert_eq!(done.failure, Some(FailureReason::Cancelled));
    // The in-flight chunk finished; nothing else was dispatched.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(done.chunks_succeeded, 1);

    // Cancelling a terminal run is a no-op.
    orch.cancel(&id).unwrap();
    assert_eq!(orch.get_status(&id).unwrap().failure, Some(FailureReason::Cancelled));
}

#[tokio::test]
async fn no_usable_documents_fails_with_no_data_and_dispatches_nothing() {
    let backend = MockBackend::echo("primary");
    let calls = backend.call_counter();
    let pool = add(empty_pool(), "primary", 1, backend);
    let docs = vec![timed_out_doc(0), timed_out_doc(1), timed_out_doc(2)];
    let orch = orchestrator(test_config(), pool, StaticFetcher::new(docs));

    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;

    assert_eq!(done.failure, Some(FailureReason::NoData));
    assert_eq!(done.chunks_total, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fetch_timeout_counts_as_unavailable_source() {
    let mut cfg = test_config();
    cfg.fetch_timeout_ms = 50;
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    let fetcher = StaticFetcher::new(ok_docs(3)).with_delay(Duration::from_secs(5));
    let orch = orchestrator(cfg, pool, fetcher);

    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;
    assert_eq!(done.failure, Some(FailureReason::NoData));
    assert!(done.degraded);
    // Low tier runs one query; its timeout is one failed document.
    assert_eq!(done.documents_failed, 1);
    let stored = orch.store().load_run(&id).await.unwrap().unwrap();
    assert_eq!(stored.documents_failed, 1);
}

#[tokio::test]
async fn collect_progress_moves_per_document() {
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    let orch = orchestrator(test_config(), pool, StaticFetcher::new(ok_docs(3)));
    let mut events = orch.subscribe();

    let id = orch.start(spec()).await.unwrap();
    let seen = collect_events(&mut events, id).await;
    let collecting: Vec<_> = seen.iter().filter(|s| s.stage == Stage::Collecting).collect();

    let ok: Vec<usize> = collecting.iter().map(|s| s.documents_ok).collect();
    assert_eq!(ok, vec![0, 1, 2, 3]);
    let percents: Vec<u8> = collecting.iter().map(|s| s.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] < w[1]), "percents: {percents:?}");
    assert_eq!(percents.last(), Some(&40));
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_work() {
    let fetcher = StaticFetcher::new(ok_docs(3));
    let fetches = fetcher.call_counter();
    let orch = orchestrator(
        test_config(),
        empty_pool(),
        fetcher,
    );

    let err = orch
        .start(InputSpec::new("   ", DepthTier::Low))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Validation(_)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let orch = orchestrator(
        test_config(),
        empty_pool(),
        StaticFetcher::new(vec![]),
    );
    let id = niche_market_analyzer::RunId::new();
    assert!(matches!(orch.get_status(&id), Err(AnalysisError::NotFound(_))));
    assert!(matches!(orch.cancel(&id), Err(AnalysisError::NotFound(_))));
    assert!(matches!(orch.report(&id).await, Err(AnalysisError::NotFound(_))));
}

#[tokio::test]
async fn no_provider_means_insufficient_analysis() {
    let orch = orchestrator(
        test_config(),
        empty_pool(),
        StaticFetcher::new(ok_docs(3)),
    );
    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;
    assert_eq!(done.failure, Some(FailureReason::InsufficientAnalysis));
    assert_eq!(done.chunks_exhausted, 8);
}

#[tokio::test]
async fn finished_runs_expire_after_retention() {
    let mut cfg = test_config();
    cfg.retention_secs = 0;
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    let orch = orchestrator(cfg, pool, StaticFetcher::new(ok_docs(3)));
    let mut events = orch.subscribe();

    let id = orch.start(spec()).await.unwrap();
    let seen = collect_events(&mut events, id).await;
    assert_eq!(seen.last().unwrap().status, RunStatus::Completed);

    assert!(matches!(orch.get_status(&id), Err(AnalysisError::NotFound(_))));
    assert_eq!(orch.prune(), 1);
}

#[tokio::test]
async fn store_failure_surfaces_as_persistence_error() {
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    // First write (pending) succeeds, every later one fails.
    let orch = niche_market_analyzer::Orchestrator::new(
        test_config(),
        pool,
        Arc::new(StaticFetcher::new(ok_docs(3))),
        Arc::new(FlakyStore::new(1)),
    );
    let mut events = orch.subscribe();
    let id = orch.start(spec()).await.unwrap();
    collect_events(&mut events, id).await;

    assert!(matches!(orch.get_status(&id), Err(AnalysisError::Persistence(_))));
}

#[tokio::test]
async fn artifact_write_failure_stays_visible_after_completion() {
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    let orch = niche_market_analyzer::Orchestrator::new(
        test_config(),
        pool,
        Arc::new(StaticFetcher::new(ok_docs(3))),
        Arc::new(FlakyStore::failing_artifacts()),
    );
    let mut events = orch.subscribe();
    let id = orch.start(spec()).await.unwrap();
    let seen = collect_events(&mut events, id).await;
    assert_eq!(seen.last().unwrap().status, RunStatus::Completed);

    // The terminal run write succeeded after the failed artifact write.
    let stored = orch.store().load_run(&id).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Done);
    match orch.get_status(&id) {
        Err(AnalysisError::Persistence(msg)) => assert!(msg.contains("artifact"), "{msg}"),
        other => panic!("expected persistence error, got {other:?}"),
    }
    assert!(orch.report(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn start_fails_when_pending_run_cannot_be_saved() {
    let orch = niche_market_analyzer::Orchestrator::new(
        test_config(),
        empty_pool(),
        Arc::new(StaticFetcher::new(ok_docs(3))),
        Arc::new(FlakyStore::new(0)),
    );
    let err = orch.start(spec()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Persistence(_)));
}

#[tokio::test]
async fn orchestrator_notes_lead_every_report() {
    let pool = add(empty_pool(), "mock", 1, MockBackend::echo("mock"));
    let orch = orchestrator(test_config(), pool, StaticFetcher::new(ok_docs(3)))
        .with_report_note("findings are placeholders");

    let id = orch.start(spec()).await.unwrap();
    finish(&orch, &id).await;
    let report = orch.report(&id).await.unwrap().unwrap();
    assert_eq!(report.notes, vec!["findings are placeholders".to_string()]);
}

#[tokio::test]
async fn verification_pass_scores_sections_and_narrative() {
    let mut cfg = test_config();
    cfg.verify_report = true;
    let reviewer = ReviewerBackend::new("APPROVED: grounded in the sources");
    let reviews = reviewer.review_counter();
    let orch = orchestrator(cfg, add(empty_pool(), "primary", 1, reviewer), StaticFetcher::new(ok_docs(3)));

    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;
    assert_eq!(done.status, RunStatus::Completed);

    let report = orch.report(&id).await.unwrap().unwrap();
    let v = report.verification.expect("verification summary");
    // Four sections with findings plus the narrative.
    assert_eq!(v.items.len(), 5);
    assert_eq!(reviews.load(Ordering::SeqCst), 5);
    assert_eq!((v.approved, v.rejected, v.errors), (5, 0, 0));
    assert!((v.quality_score - 100.0).abs() < 1e-6);
    assert_eq!(v.items.last().unwrap().label, "Narrative");
    assert!(report.notes.is_empty());
}

#[tokio::test]
async fn rejected_items_are_noted_without_failing_the_run() {
    let mut cfg = test_config();
    cfg.verify_report = true;
    let pool = add(empty_pool(), "primary", 1, ReviewerBackend::new("REJECTED\nGeneric filler."));
    let orch = orchestrator(cfg, pool, StaticFetcher::new(ok_docs(3)));

    let id = orch.start(spec()).await.unwrap();
    let done = finish(&orch, &id).await;
    assert_eq!(done.status, RunStatus::Completed);

    let report = orch.report(&id).await.unwrap().unwrap();
    let v = report.verification.unwrap();
    assert_eq!(v.rejected, 5);
    assert_eq!(v.quality_score, 0.0);
    assert_eq!(v.items[0].reason.as_deref(), Some("Generic filler."));
    assert!(report
        .notes
        .iter()
        .any(|n| n.starts_with("verification rejected 5 of 5 items")));
}
