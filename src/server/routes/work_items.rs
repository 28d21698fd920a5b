use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::model::{ApprovalRequest, QueueEntry, Run, RetryPolicyOverride, WorkItem};
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct CreateWorkItemRequest {
    project_id: Uuid,
    title: String,
    #[serde(default)]
    description: Option<String>,
}

pub async fn create_work_item(
    State(kernel): State<AppState>,
    Json(req): Json<CreateWorkItemRequest>,
) -> Result<Json<WorkItem>, AppError> {
    if req.title.trim().is_empty() {
        return Err(AppError::validation("title", "must not be empty"));
    }

    let mut builder = WorkItem::builder().project_id(req.project_id).title(req.title);
    if let Some(description) = req.description {
        builder = builder.description(description);
    }
    let work_item = builder.build();

    sqlx::query(
        "INSERT INTO work_items (id, project_id, title, description, tool_recipe, max_retries,
                backoff_base_seconds, backoff_jitter_seconds, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(work_item.id)
    .bind(work_item.project_id)
    .bind(&work_item.title)
    .bind(&work_item.description)
    .bind(&work_item.tool_recipe)
    .bind(work_item.max_retries)
    .bind(work_item.backoff_base_seconds)
    .bind(work_item.backoff_jitter_seconds)
    .bind(work_item.created_at)
    .bind(work_item.updated_at)
    .execute(kernel.store.pool())
    .await?;

    Ok(Json(work_item))
}

/// Stores the validated recipe value opaquely; the core never parses it.
pub async fn set_tool_recipe(
    State(kernel): State<AppState>,
    Path(work_item_id): Path<Uuid>,
    Json(recipe): Json<serde_json::Value>,
) -> Result<Json<WorkItem>, AppError> {
    let updated: Option<WorkItem> = sqlx::query_as(
        "UPDATE work_items SET tool_recipe = $1, updated_at = now() WHERE id = $2
         RETURNING id, project_id, title, description, tool_recipe, max_retries,
                   backoff_base_seconds, backoff_jitter_seconds, created_at, updated_at",
    )
    .bind(recipe)
    .bind(work_item_id)
    .fetch_optional(kernel.store.pool())
    .await?;

    updated
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("work item {work_item_id}")))
}

pub async fn set_policy(
    State(kernel): State<AppState>,
    Path(work_item_id): Path<Uuid>,
    Json(policy): Json<RetryPolicyOverride>,
) -> Result<Json<WorkItem>, AppError> {
    let updated: Option<WorkItem> = sqlx::query_as(
        "UPDATE work_items SET max_retries = $1, backoff_base_seconds = $2,
                backoff_jitter_seconds = $3, updated_at = now()
         WHERE id = $4
         RETURNING id, project_id, title, description, tool_recipe, max_retries,
                   backoff_base_seconds, backoff_jitter_seconds, created_at, updated_at",
    )
    .bind(policy.max_retries)
    .bind(policy.backoff_base_seconds)
    .bind(policy.backoff_jitter_seconds)
    .bind(work_item_id)
    .fetch_optional(kernel.store.pool())
    .await?;

    updated
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("work item {work_item_id}")))
}

pub async fn request_approval(
    State(kernel): State<AppState>,
    Path(work_item_id): Path<Uuid>,
) -> Result<Json<ApprovalRequest>, AppError> {
    let request = kernel.approval_gate.request(work_item_id).await?;
    Ok(Json(request))
}

#[derive(Deserialize)]
pub struct DecideApprovalRequest {
    approve: bool,
}

pub async fn decide_approval(
    State(kernel): State<AppState>,
    Path(approval_id): Path<Uuid>,
    Json(req): Json<DecideApprovalRequest>,
) -> Result<Json<ApprovalRequest>, AppError> {
    let now = kernel.clock.now();
    let decided = kernel.approval_gate.decide(approval_id, req.approve, now).await?;
    Ok(Json(decided))
}

/// Convenience enqueue with no dependency and default priority/delay — the
/// equivalent of `POST /scheduler/enqueue` scoped to a single work item.
pub async fn start_work_item(
    State(kernel): State<AppState>,
    Path(work_item_id): Path<Uuid>,
) -> Result<Json<QueueEntry>, AppError> {
    let entry = kernel
        .scheduler
        .enqueue(work_item_id, None, 0, 0, kernel.clock.as_ref())
        .await?;
    Ok(Json(entry))
}

pub async fn list_runs(
    State(kernel): State<AppState>,
    Path(work_item_id): Path<Uuid>,
) -> Result<Json<Vec<Run>>, AppError> {
    let runs = kernel.run_lifecycle.list_runs(work_item_id).await?;
    Ok(Json(runs))
}
