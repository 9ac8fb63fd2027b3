//! HTTP API
//!
//! Minimal surface for manual triggers and status inspection. The
//! administrative UI lives elsewhere; these routes are what a cron tick or
//! an operator curl needs.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use backhaul_core::domain::{Agent, JobRun, TaskKind, WorkUnit};
use backhaul_core::rpc::RpcError;

use crate::engine::{EngineError, JobRunEngine};
use crate::hub::RpcHub;
use crate::repository::Repository;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobRunEngine>,
    pub repo: Arc<dyn Repository>,
    pub hub: Arc<RpcHub>,
}

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalError(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::PipelineNotFound(_)
            | EngineError::RunNotFound(_)
            | EngineError::WorkUnitNotFound(_) => ApiError::NotFound(err.to_string()),
            EngineError::DuplicateRun(_) => ApiError::Conflict(err.to_string()),
            EngineError::LockTimeout(_) => ApiError::Unavailable(err.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<RpcError> for ApiError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::NotConnected(_) | RpcError::Timeout => ApiError::Unavailable(err.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/pipeline/list", get(list_pipelines))
        .route("/pipeline/{id}/run", post(trigger_run))
        .route("/run/{id}", get(get_run))
        .route("/run/{id}/units", get(get_run_units))
        .route("/run/{id}/stop", post(stop_run))
        .route("/agent/list", get(list_agents))
        .route("/agent/{key}/test-connection", post(agent_test_connection))
        .route("/agent/{key}/databases", post(agent_list_databases))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Kind-scoped settings for a connectivity probe or database listing,
/// forwarded verbatim to the agent's adapter.
#[derive(Debug, Deserialize)]
struct ProbeRequest {
    kind: TaskKind,
    #[serde(default)]
    settings: HashMap<String, serde_json::Value>,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_pipelines(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let pipelines = state
        .repo
        .list_active_pipelines()
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    let summaries: Vec<serde_json::Value> = pipelines
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "name": p.name,
                "schedule": p.schedule,
                "stages": p.stages.len(),
            })
        })
        .collect();
    Ok(Json(serde_json::json!(summaries)))
}

async fn trigger_run(
    State(state): State<AppState>,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let run_id = state.engine.setup_job_run(pipeline_id).await?;
    Ok(Json(serde_json::json!({ "run_id": run_id })))
}

async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> ApiResult<Json<JobRun>> {
    let run = state
        .repo
        .find_run(run_id)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("run {} not found", run_id)))?;
    Ok(Json(run))
}

async fn get_run_units(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkUnit>>> {
    state
        .repo
        .find_run(run_id)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("run {} not found", run_id)))?;
    let units = state
        .repo
        .work_units_for_run(run_id)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(units))
}

async fn stop_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.stop_job_run(run_id).await?;
    Ok(Json(serde_json::json!({ "stopped": run_id })))
}

async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<Agent>>> {
    let agents = state
        .repo
        .list_agents()
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(agents))
}

async fn agent_test_connection(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(probe): Json<ProbeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let message = state
        .hub
        .test_connection(&key, probe.kind, probe.settings)
        .await?;
    Ok(Json(serde_json::json!({ "message": message })))
}

async fn agent_list_databases(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(probe): Json<ProbeRequest>,
) -> ApiResult<Json<Vec<String>>> {
    let databases = state
        .hub
        .list_databases(&key, probe.kind, probe.settings)
        .await?;
    Ok(Json(databases))
}
