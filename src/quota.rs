//! Quota Meter: windowed admission counter per project.
//!
//! Backed by a query against `runs` rather than an in-memory ring buffer, so
//! the Store stays the single source of truth for admission state (no
//! separate durability story to reconcile after a restart). A run reserves
//! its quota slot the instant the Scheduler promotes it — before it has a
//! `started_at` — so that a single `tick()` promoting several entries for
//! the same project in a fixpoint pass can't all see `used = 0` and overrun
//! `max_runs` before any of them are claimed.

use sqlx::PgPool;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::model::Quota;

#[derive(Clone)]
pub struct QuotaMeter {
    pool: PgPool,
}

impl QuotaMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// True if admitting one more run start for `project_id` would keep the
    /// rolling `window_seconds` window at or under `max_runs`. Counts all
    /// run starts, retries included, plus any run already promoted but not
    /// yet claimed — those have reserved a slot even though `started_at`
    /// isn't set yet.
    ///
    /// Takes the caller's executor rather than always hitting the pool: the
    /// Scheduler calls this from inside its promotion transaction, and
    /// reservations made earlier in the same `tick()` pass are only visible
    /// there before that transaction commits.
    pub async fn admits<'c, E>(
        &self,
        project_id: Uuid,
        quota: &Quota,
        clock: &dyn Clock,
        executor: E,
    ) -> Result<bool, AppError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let window_start = clock.now() - chrono::Duration::seconds(quota.window_seconds);

        let used: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM runs r
             JOIN work_items w ON w.id = r.work_item_id
             WHERE w.project_id = $1
               AND ((r.started_at IS NOT NULL AND r.started_at >= $2)
                    OR (r.started_at IS NULL AND r.state = 'queued'))",
        )
        .bind(project_id)
        .bind(window_start)
        .fetch_one(executor)
        .await?;

        Ok(used < quota.max_runs)
    }

    /// Usage snapshot for `GET /observability/usage`.
    pub async fn usage(
        &self,
        project_id: Uuid,
        quota: &Quota,
        clock: &dyn Clock,
    ) -> Result<QuotaUsage, AppError> {
        let now = clock.now();
        let window_start = now - chrono::Duration::seconds(quota.window_seconds);

        let used: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM runs r
             JOIN work_items w ON w.id = r.work_item_id
             WHERE w.project_id = $1
               AND ((r.started_at IS NOT NULL AND r.started_at >= $2)
                    OR (r.started_at IS NULL AND r.state = 'queued'))",
        )
        .bind(project_id)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        let earliest: Option<chrono::DateTime<chrono::Utc>> = sqlx::query_scalar(
            "SELECT min(r.started_at) FROM runs r
             JOIN work_items w ON w.id = r.work_item_id
             WHERE w.project_id = $1 AND r.started_at IS NOT NULL AND r.started_at >= $2",
        )
        .bind(project_id)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        let resets_at = earliest
            .map(|e| e + chrono::Duration::seconds(quota.window_seconds))
            .unwrap_or(now);

        Ok(QuotaUsage {
            used,
            max_runs: quota.max_runs,
            window_seconds: quota.window_seconds,
            resets_at,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QuotaUsage {
    pub used: i64,
    pub max_runs: i64,
    pub window_seconds: i64,
    pub resets_at: chrono::DateTime<chrono::Utc>,
}
