// tests/metrics.rs
mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use common::*;
use niche_market_analyzer::api::{self, AppState};
use niche_market_analyzer::metrics::Metrics;
use niche_market_analyzer::model::{DepthTier, InputSpec};
use niche_market_analyzer::providers::MockBackend;

#[tokio::test]
async fn metrics_endpoint_contains_expected_series() {
    let metrics = Metrics::global().expect("install recorder");
    let pool = add(empty_pool(), "primary", 1, MockBackend::echo("primary"));
    let orch = Arc::new(orchestrator(test_config(), pool, StaticFetcher::new(ok_docs(3))));
    let app = api::app(
        AppState {
            orchestrator: orch.clone(),
        },
        metrics,
    );

    // One full run so every series has a sample.
    let id = orch
        .start(InputSpec::new("productivity courses", DepthTier::Low))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), orch.wait(&id))
        .await
        .unwrap()
        .unwrap();

    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "runs_started_total",
        "runs_total",
        "chunks_total",
        "provider_calls_total",
        "provider_call_ms",
        "stage_ms",
    ] {
        assert!(
            text.contains(needle),
            "expected /metrics to contain `{needle}`; got:\n{text}"
        );
    }
}
