use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::model::{Project, Run, RunStep};
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct MetricsResponse {
    queue_depth: i64,
    runs_running: i64,
    runs_queued: i64,
}

/// Coarse process metrics. Not a Prometheus exposition — just enough to
/// eyeball backlog and concurrency without a metrics scrape pipeline.
pub async fn metrics_handler(
    State(kernel): State<AppState>,
) -> Result<Json<MetricsResponse>, AppError> {
    let pool = kernel.store.pool();

    let queue_depth: i64 =
        sqlx::query_scalar("SELECT count(*) FROM queue_entries WHERE state = 'queued'")
            .fetch_one(pool)
            .await?;
    let runs_running: i64 = sqlx::query_scalar("SELECT count(*) FROM runs WHERE state = 'running'")
        .fetch_one(pool)
        .await?;
    let runs_queued: i64 = sqlx::query_scalar("SELECT count(*) FROM runs WHERE state = 'queued'")
        .fetch_one(pool)
        .await?;

    Ok(Json(MetricsResponse {
        queue_depth,
        runs_running,
        runs_queued,
    }))
}

#[derive(Serialize)]
pub struct TraceSummary {
    trace_id: Uuid,
    run_id: Uuid,
    work_item_id: Uuid,
    state: crate::model::RunState,
}

/// Recent runs keyed by their `trace_id`, the closest the core gets to a
/// distributed trace index without an external collector.
pub async fn traces_handler(
    State(kernel): State<AppState>,
) -> Result<Json<Vec<TraceSummary>>, AppError> {
    let rows: Vec<Run> = sqlx::query_as(
        "SELECT id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at
         FROM runs ORDER BY id DESC LIMIT 100",
    )
    .fetch_all(kernel.store.pool())
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|r| TraceSummary {
                trace_id: r.trace_id,
                run_id: r.id,
                work_item_id: r.work_item_id,
                state: r.state,
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct RunSnapshot {
    run: Run,
    steps: Vec<RunStep>,
}

pub async fn run_snapshot_handler(
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunSnapshot>, AppError> {
    let run = kernel.run_lifecycle.get_run(run_id).await?;
    let steps = kernel.run_lifecycle.list_steps(run_id).await?;
    Ok(Json(RunSnapshot { run, steps }))
}

#[derive(Deserialize)]
pub struct UsageQuery {
    project_id: Uuid,
}

pub async fn usage_handler(
    State(kernel): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<crate::quota::QuotaUsage>, AppError> {
    let project: Option<Project> = sqlx::query_as(
        "SELECT id, name, description, quota_window_seconds, quota_max_runs, created_at, updated_at
         FROM projects WHERE id = $1",
    )
    .bind(query.project_id)
    .fetch_optional(kernel.store.pool())
    .await?;
    let project = project.ok_or_else(|| AppError::NotFound(format!("project {}", query.project_id)))?;

    let usage = kernel
        .quota_meter
        .usage(project.id, &project.quota(), kernel.clock.as_ref())
        .await?;

    Ok(Json(usage))
}
