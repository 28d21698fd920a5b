use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::lease::{ClaimOutcome, HeartbeatOutcome};
use crate::model::{LogEntry, LogStream, Run, RunStep, RunStepStatus};
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct ClaimRequest {
    agent_id: String,
    #[serde(default)]
    ttl_seconds: Option<i64>,
}

#[derive(serde::Serialize)]
pub struct ClaimResponse {
    granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    claim_expires_at: Option<DateTime<Utc>>,
}

pub async fn claim_run(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, AppError> {
    let ttl = chrono::Duration::seconds(req.ttl_seconds.unwrap_or(kernel.config.default_claim_ttl_seconds));

    let outcome = kernel
        .lease_manager
        .claim(run_id, &req.agent_id, ttl, kernel.clock.as_ref())
        .await?;

    Ok(Json(match outcome {
        ClaimOutcome::Granted { claim_expires_at } => ClaimResponse {
            granted: true,
            claim_expires_at: Some(claim_expires_at),
        },
        ClaimOutcome::Busy => ClaimResponse {
            granted: false,
            claim_expires_at: None,
        },
    }))
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    agent_id: String,
    #[serde(default)]
    ttl_seconds: Option<i64>,
}

#[derive(serde::Serialize)]
pub struct HeartbeatResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    claim_expires_at: Option<DateTime<Utc>>,
}

pub async fn heartbeat_run(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let ttl = chrono::Duration::seconds(req.ttl_seconds.unwrap_or(kernel.config.default_claim_ttl_seconds));

    let outcome = kernel
        .lease_manager
        .heartbeat(run_id, &req.agent_id, ttl, kernel.clock.as_ref())
        .await?;

    Ok(Json(match outcome {
        HeartbeatOutcome::Ok { claim_expires_at } => HeartbeatResponse {
            ok: true,
            claim_expires_at: Some(claim_expires_at),
        },
        HeartbeatOutcome::Lost => HeartbeatResponse {
            ok: false,
            claim_expires_at: None,
        },
    }))
}

#[derive(Deserialize)]
pub struct CompleteQuery {
    success: bool,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    agent_id: String,
}

pub async fn complete_run(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<CompleteQuery>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Run>, AppError> {
    let run = kernel
        .run_lifecycle
        .complete(run_id, &req.agent_id, query.success, kernel.clock.as_ref())
        .await?;
    Ok(Json(run))
}

#[derive(Deserialize)]
pub struct ListLogsQuery {
    #[serde(default = "default_format")]
    format: String,
    #[serde(default)]
    q: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_format() -> String {
    "json".to_string()
}

fn default_limit() -> i64 {
    1000
}

pub async fn list_logs(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<ListLogsQuery>,
) -> Result<axum::response::Response, AppError> {
    use axum::response::IntoResponse;

    let mut entries = kernel.run_lifecycle.list_logs(run_id, query.limit, query.offset).await?;
    if let Some(needle) = &query.q {
        entries.retain(|e| e.text.contains(needle.as_str()));
    }

    if query.format == "text" {
        let body = entries
            .iter()
            .map(|e| format!("[{}] {:?}: {}", e.timestamp.to_rfc3339(), e.stream, e.text))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(([("content-type", "text/plain; charset=utf-8")], body).into_response())
    } else {
        Ok(Json(entries).into_response())
    }
}

#[derive(Deserialize)]
pub struct CreateStepRequest {
    idx: i32,
    name: String,
}

pub async fn create_step(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<CreateStepRequest>,
) -> Result<Json<RunStep>, AppError> {
    let step = kernel.run_lifecycle.create_step(run_id, req.idx, req.name).await?;
    Ok(Json(step))
}

pub async fn list_steps(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Vec<RunStep>>, AppError> {
    let steps = kernel.run_lifecycle.list_steps(run_id).await?;
    Ok(Json(steps))
}

#[derive(Deserialize)]
pub struct UpdateStepRequest {
    status: RunStepStatus,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

pub async fn update_step(
    State(kernel): State<AppState>,
    Path(step_id): Path<Uuid>,
    Json(req): Json<UpdateStepRequest>,
) -> Result<Json<RunStep>, AppError> {
    let step = kernel
        .run_lifecycle
        .update_step(step_id, req.status, req.started_at, req.finished_at, req.metadata)
        .await?;
    Ok(Json(step))
}

/// Convenience append used by tests and simple agents that don't go through
/// the step machinery — a thin wrapper over `RunLifecycle::append_log`.
#[derive(Deserialize)]
pub struct AppendLogRequest {
    stream: LogStream,
    text: String,
}

pub async fn append_log(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<AppendLogRequest>,
) -> Result<Json<LogEntry>, AppError> {
    let entry = kernel
        .run_lifecycle
        .append_log(run_id, req.stream, req.text, kernel.clock.as_ref())
        .await?;
    Ok(Json(entry))
}
