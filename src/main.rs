//! Niche Market Analyzer: binary entrypoint.
//! Boots the Axum HTTP server around the analysis orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use niche_market_analyzer::api::{self, AppState};
use niche_market_analyzer::bootstrap::build_orchestrator;
use niche_market_analyzer::config::load_config_default;
use niche_market_analyzer::metrics::Metrics;
use niche_market_analyzer::orchestrator::spawn_retention_sweeper;

const DEFAULT_ADDR: &str = "0.0.0.0:8000";
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Compact logs by default; `LOG_FORMAT=json` for structured output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("orchestrator=info,pool=info,collect=info,analyze=info,synthesize=info,store=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let metrics = Metrics::global()?;
    let cfg = load_config_default()?;
    let orchestrator = Arc::new(build_orchestrator(cfg)?);
    spawn_retention_sweeper(orchestrator.clone(), SWEEP_PERIOD);

    let app = api::app(AppState { orchestrator }, metrics);

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .context("parsing BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(target: "orchestrator", %addr, "listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
