// HTTP transport for remote workers and operators

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::adviser::InterventionDecision;
use crate::dispatcher::{TaskResult, WorkerDescriptor};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::types::{NodeExecutionId, RunId, TaskId, WorkerId};

pub type AppState = Arc<Engine>;

/// Longest a worker may hold a poll open.
const MAX_POLL_WAIT_MS: u64 = 30_000;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/workers", post(register_worker))
        .route("/workers/{id}/poll", post(poll_task))
        .route("/tasks/{id}/complete", post(complete_task))
        .route("/tasks/{id}/abort", post(abort_task))
        .route("/interventions/{id}", post(resolve_intervention))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/abort", post(abort_run))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::DuplicateKey(_)
        | EngineError::AlreadyAcquired { .. }
        | EngineError::InvalidTransition(_) => StatusCode::CONFLICT,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: EngineError) -> StatusCode {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    } else {
        warn!(error = %err, "Request rejected");
    }
    status
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn register_worker(
    State(engine): State<AppState>,
    Json(worker): Json<WorkerDescriptor>,
) -> Result<Json<Value>, StatusCode> {
    let id = worker.id.clone();
    engine.dispatcher().register_worker(worker).await;
    Ok(Json(serde_json::json!({ "status": "registered", "worker_id": id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PollRequest {
    wait_ms: u64,
}

async fn poll_task(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PollRequest>,
) -> Result<Json<Value>, StatusCode> {
    let wait = Duration::from_millis(request.wait_ms.min(MAX_POLL_WAIT_MS));
    let task = engine
        .dispatcher()
        .poll(&WorkerId::new(id), wait)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "task": task })))
}

async fn complete_task(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(result): Json<TaskResult>,
) -> Result<Json<Value>, StatusCode> {
    let outcome = engine
        .dispatcher()
        .complete(&TaskId::new(id), result)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

async fn abort_task(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let aborted = engine
        .dispatcher()
        .abort(&TaskId::new(id))
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "aborted": aborted })))
}

#[derive(Debug, Deserialize)]
struct InterventionRequest {
    decision: InterventionDecision,
}

async fn resolve_intervention(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<InterventionRequest>,
) -> Result<Json<Value>, StatusCode> {
    engine
        .intervene(&NodeExecutionId::new(id), request.decision)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "status": "resolved" })))
}

async fn get_run(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let run_id = RunId::new(id);
    let outcome = engine
        .run_outcome(&run_id)
        .await
        .map_err(reject)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let nodes: Vec<Value> = engine
        .node_executions(&run_id)
        .await
        .map_err(reject)?
        .into_iter()
        .map(|ne| {
            serde_json::json!({
                "id": ne.id,
                "plan_node_id": ne.plan_node_id,
                "status": ne.status,
                "retry_count": ne.retry_count,
                "failure": ne.failure,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "run": outcome,
        "node_executions": nodes,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AbortRequest {
    reason: Option<String>,
}

async fn abort_run(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AbortRequest>,
) -> Result<Json<Value>, StatusCode> {
    let reason = request.reason.unwrap_or_else(|| "aborted by operator".to_string());
    engine
        .abort_run(&RunId::new(id), &reason)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "status": "aborted" })))
}
