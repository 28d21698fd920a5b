use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::model::{Project, Quota};
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    quota: Option<Quota>,
}

pub async fn create_project(
    State(kernel): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>, AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }

    let mut builder = Project::builder().name(req.name);
    if let Some(description) = req.description {
        builder = builder.description(description);
    }
    if let Some(quota) = &req.quota {
        builder = builder
            .quota_window_seconds(quota.window_seconds)
            .quota_max_runs(quota.max_runs);
    }
    let project = builder.build();

    sqlx::query(
        "INSERT INTO projects (id, name, description, quota_window_seconds, quota_max_runs, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(project.id)
    .bind(&project.name)
    .bind(&project.description)
    .bind(project.quota_window_seconds)
    .bind(project.quota_max_runs)
    .bind(project.created_at)
    .bind(project.updated_at)
    .execute(kernel.store.pool())
    .await?;

    Ok(Json(project))
}

pub async fn list_projects(State(kernel): State<AppState>) -> Result<Json<Vec<Project>>, AppError> {
    let rows = sqlx::query_as(
        "SELECT id, name, description, quota_window_seconds, quota_max_runs, created_at, updated_at
         FROM projects ORDER BY created_at DESC",
    )
    .fetch_all(kernel.store.pool())
    .await?;
    Ok(Json(rows))
}

pub async fn update_quota(
    State(kernel): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(quota): Json<Quota>,
) -> Result<Json<Project>, AppError> {
    let updated: Option<Project> = sqlx::query_as(
        "UPDATE projects SET quota_window_seconds = $1, quota_max_runs = $2, updated_at = now()
         WHERE id = $3
         RETURNING id, name, description, quota_window_seconds, quota_max_runs, created_at, updated_at",
    )
    .bind(quota.window_seconds)
    .bind(quota.max_runs)
    .bind(project_id)
    .fetch_optional(kernel.store.pool())
    .await?;

    updated
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("project {project_id}")))
}
