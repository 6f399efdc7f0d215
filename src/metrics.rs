// src/metrics.rs
use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

static GLOBAL: OnceCell<Metrics> = OnceCell::new();

impl Metrics {
    /// Install the process-wide Prometheus recorder.
    pub fn init() -> anyhow::Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// The installed recorder; installs it on first use.
    pub fn global() -> anyhow::Result<&'static Metrics> {
        GLOBAL.get_or_try_init(Self::init)
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("runs_started_total", "Runs accepted by start().");
        describe_counter!(
            "runs_total",
            "Runs that reached a terminal state, by outcome."
        );
        describe_counter!("runs_cancel_requests_total", "Cancel requests on live runs.");
        describe_gauge!("runs_active", "Runs whose pipeline task is still executing.");
        describe_histogram!("run_duration_ms", "Wall time of a run's pipeline in milliseconds.");
        describe_histogram!("stage_ms", "Wall time per stage in milliseconds.");
        describe_histogram!("fetch_ms", "Single source fetch time in milliseconds.");
        describe_counter!(
            "fetch_documents_total",
            "Fetched documents, by fetch status."
        );
        describe_counter!("chunks_total", "Resolved analysis chunks, by outcome.");
        describe_counter!(
            "provider_calls_total",
            "Provider calls, by provider and outcome."
        );
        describe_counter!(
            "provider_suspensions_total",
            "Times a provider was suspended."
        );
        describe_histogram!("provider_call_ms", "Provider call time in milliseconds.");
        describe_counter!(
            "narratives_total",
            "Report narratives, by source (provider or local)."
        );
        describe_counter!(
            "verifications_total",
            "Verified report items, by verdict."
        );
        describe_counter!("store_errors_total", "Failed run or artifact writes.");
    });
}
