use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::model::QueueEntry;
use crate::scheduler::TickSummary;
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct EnqueueRequest {
    work_item_id: Uuid,
    #[serde(default)]
    depends_on_work_item_id: Option<Uuid>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    delay_seconds: i64,
}

pub async fn enqueue(
    State(kernel): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<QueueEntry>, AppError> {
    let entry = kernel
        .scheduler
        .enqueue(
            req.work_item_id,
            req.depends_on_work_item_id,
            req.priority,
            req.delay_seconds,
            kernel.clock.as_ref(),
        )
        .await?;
    Ok(Json(entry))
}

pub async fn tick(State(kernel): State<AppState>) -> Result<Json<TickSummary>, AppError> {
    let summary = kernel.scheduler.tick(kernel.clock.as_ref()).await?;
    Ok(Json(summary))
}

pub async fn list_queue(State(kernel): State<AppState>) -> Result<Json<Vec<QueueEntry>>, AppError> {
    let queue = kernel.scheduler.list_queue().await?;
    Ok(Json(queue))
}

#[derive(Deserialize)]
pub struct RequeueWorkItemRequest {
    work_item_id: Uuid,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    delay_seconds: i64,
}

pub async fn requeue_work_item(
    State(kernel): State<AppState>,
    Json(req): Json<RequeueWorkItemRequest>,
) -> Result<Json<QueueEntry>, AppError> {
    let entry = kernel
        .scheduler
        .requeue_work_item(req.work_item_id, req.priority, req.delay_seconds, kernel.clock.as_ref())
        .await?;
    Ok(Json(entry))
}

#[derive(Deserialize)]
pub struct RequeueRunRequest {
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    delay_seconds: i64,
}

pub async fn requeue_run(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<RequeueRunRequest>,
) -> Result<Json<QueueEntry>, AppError> {
    let entry = kernel
        .scheduler
        .requeue_run(run_id, req.priority, req.delay_seconds, kernel.clock.as_ref())
        .await?;
    Ok(Json(entry))
}
