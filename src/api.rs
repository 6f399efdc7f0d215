// src/api.rs
//! Thin HTTP adapter over the orchestrator.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::error::AnalysisError;
use crate::metrics::Metrics;
use crate::model::{DepthTier, InputSpec, ProgressSnapshot, RunId};
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/analysis", post(start_analysis))
        .route("/analysis/{id}", get(get_status))
        .route("/analysis/{id}/cancel", post(cancel_analysis))
        .route("/analysis/{id}/report", get(get_report))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// API routes plus `/metrics`.
pub fn app(state: AppState, metrics: &Metrics) -> Router {
    router(state).merge(metrics.router())
}

/// Error body: `{"error": "...", "kind": "..."}`.
pub struct ApiError(AnalysisError);

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            AnalysisError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AnalysisError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AnalysisError::Persistence(_) => (StatusCode::SERVICE_UNAVAILABLE, "persistence"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
                kind,
            }),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct StartReq {
    niche: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    depth: Option<String>,
}

#[derive(Serialize)]
struct StartResp {
    run_id: RunId,
}

fn parse_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse::<RunId>()
        .map_err(|_| ApiError(AnalysisError::Validation(format!("invalid run id '{raw}'"))))
}

async fn start_analysis(
    State(state): State<AppState>,
    Json(body): Json<StartReq>,
) -> Result<(StatusCode, Json<StartResp>), ApiError> {
    let depth = match body.depth.as_deref() {
        Some(d) => d.parse::<DepthTier>()?,
        None => DepthTier::Medium,
    };
    let mut input = InputSpec::new(body.niche, depth);
    input.description = body.description;
    let run_id = state.orchestrator.start(input).await?;
    Ok((StatusCode::ACCEPTED, Json(StartResp { run_id })))
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_status(&id)?))
}

async fn cancel_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.orchestrator.cancel(&id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_report(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.orchestrator.report(&id).await {
        Ok(Some(report)) => Json(report).into_response(),
        // Known run, no report yet (or it failed): point callers back at the status.
        Ok(None) => match state.orchestrator.get_status(&id) {
            Ok(snap) => (StatusCode::CONFLICT, Json(snap)).into_response(),
            Err(e) => ApiError(e).into_response(),
        },
        Err(e) => ApiError(e).into_response(),
    }
}
