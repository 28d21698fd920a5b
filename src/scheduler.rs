//! The dependency-aware scheduler: queue, ready-set computation, delayed
//! release, priorities, per-project quotas.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::clock::Clock;
use crate::error::AppError;
use crate::model::{Project, QueueEntry, QueueEntryState, Run, RunState, WorkItem};
use crate::quota::QuotaMeter;

/// Bound on how many fixpoint passes a single `tick()` call will run.
/// Promoting one entry can make another eligible in the same tick (e.g.
/// fan-in after a shared dependency succeeds); this caps the work instead of
/// looping unboundedly on an adversarial queue shape.
pub const MAX_TICK_PASSES: usize = 16;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TickSummary {
    pub promoted: Vec<PromotedRun>,
    pub passes: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PromotedRun {
    pub queue_entry_id: Uuid,
    pub run_id: Uuid,
    pub work_item_id: Uuid,
}

#[derive(Clone)]
pub struct Scheduler {
    pool: PgPool,
    approval_gate: ApprovalGate,
    quota_meter: QuotaMeter,
}

impl Scheduler {
    pub fn new(pool: PgPool, approval_gate: ApprovalGate, quota_meter: QuotaMeter) -> Self {
        Self {
            pool,
            approval_gate,
            quota_meter,
        }
    }

    /// Duplicate entries are allowed: parallel dependency fan-in is modeled
    /// by enqueueing one entry per dependent work item.
    pub async fn enqueue(
        &self,
        work_item_id: Uuid,
        depends_on_work_item_id: Option<Uuid>,
        priority: i32,
        delay_seconds: i64,
        clock: &dyn Clock,
    ) -> Result<QueueEntry, AppError> {
        let now = clock.now();
        let entry = QueueEntry::builder()
            .work_item_id(work_item_id)
            .depends_on_work_item_id(depends_on_work_item_id)
            .priority(priority)
            .scheduled_for(now + chrono::Duration::seconds(delay_seconds))
            .enqueued_at(now)
            .build();

        sqlx::query(
            "INSERT INTO queue_entries (id, work_item_id, depends_on_work_item_id, priority, scheduled_for, enqueued_at, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.work_item_id)
        .bind(entry.depends_on_work_item_id)
        .bind(entry.priority)
        .bind(entry.scheduled_for)
        .bind(entry.enqueued_at)
        .bind(entry.state)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    pub async fn requeue_work_item(
        &self,
        work_item_id: Uuid,
        priority: i32,
        delay_seconds: i64,
        clock: &dyn Clock,
    ) -> Result<QueueEntry, AppError> {
        self.enqueue(work_item_id, None, priority, delay_seconds, clock)
            .await
    }

    /// Explicit operator re-enqueue for a specific run's work item, used for
    /// manual retries outside the automatic failure path.
    pub async fn requeue_run(
        &self,
        run_id: Uuid,
        priority: i32,
        delay_seconds: i64,
        clock: &dyn Clock,
    ) -> Result<QueueEntry, AppError> {
        let run: Option<Run> = sqlx::query_as(
            "SELECT id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                    duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at
             FROM runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(run) = run else {
            return Err(AppError::NotFound(format!("run {run_id}")));
        };
        self.enqueue(run.work_item_id, None, priority, delay_seconds, clock)
            .await
    }

    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>, AppError> {
        let rows = sqlx::query_as(
            "SELECT id, work_item_id, depends_on_work_item_id, priority, scheduled_for, enqueued_at, state
             FROM queue_entries
             ORDER BY priority DESC, enqueued_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn peek(&self, limit: i64) -> Result<Vec<QueueEntry>, AppError> {
        let rows = sqlx::query_as(
            "SELECT id, work_item_id, depends_on_work_item_id, priority, scheduled_for, enqueued_at, state
             FROM queue_entries
             WHERE state = 'queued'
             ORDER BY priority DESC, enqueued_at ASC, id ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// An atomic pass that selects due, queued entries ordered by
    /// `(priority DESC, enqueued_at ASC, id ASC)` and attempts to promote
    /// each in order, re-evaluating until a fixpoint or `MAX_TICK_PASSES`.
    pub async fn tick(&self, clock: &dyn Clock) -> Result<TickSummary, AppError> {
        let mut summary = TickSummary::default();

        for _ in 0..MAX_TICK_PASSES {
            summary.passes += 1;
            let now = clock.now();
            let mut tx = self.pool.begin().await?;

            let candidates: Vec<QueueEntry> = sqlx::query_as(
                "SELECT id, work_item_id, depends_on_work_item_id, priority, scheduled_for, enqueued_at, state
                 FROM queue_entries
                 WHERE state = 'queued' AND scheduled_for <= $1
                 ORDER BY priority DESC, enqueued_at ASC, id ASC
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

            if candidates.is_empty() {
                tx.commit().await?;
                break;
            }

            let mut promoted_this_pass = 0usize;
            for entry in candidates {
                if let Some(promotion) = self.try_promote(&mut tx, &entry, now).await? {
                    summary.promoted.push(promotion);
                    promoted_this_pass += 1;
                }
            }

            tx.commit().await?;

            if promoted_this_pass == 0 {
                break;
            }
        }

        Ok(summary)
    }

    /// Evaluates the promotion predicate for one entry and, if it holds,
    /// consumes the entry and creates a fresh queued `Run`.
    async fn try_promote(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &QueueEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<PromotedRun>, AppError> {
        // (1) scheduled_for <= now already guaranteed by the candidate query.

        // (2) dependency satisfied: the dependency's most recent terminal
        // run (ordered by completion time, since only terminal runs carry
        // finished_at) must be `succeeded`. No dependency is trivially
        // satisfied.
        if let Some(dep) = entry.depends_on_work_item_id {
            let dep_state: Option<RunState> = sqlx::query_scalar(
                "SELECT state FROM runs
                 WHERE work_item_id = $1 AND finished_at IS NOT NULL
                 ORDER BY finished_at DESC LIMIT 1",
            )
            .bind(dep)
            .fetch_optional(&mut **tx)
            .await?;

            match dep_state {
                Some(RunState::Succeeded) => {}
                _ => return Ok(None),
            }
        }

        let work_item: Option<WorkItem> = sqlx::query_as(
            "SELECT id, project_id, title, description, tool_recipe, max_retries,
                    backoff_base_seconds, backoff_jitter_seconds, created_at, updated_at
             FROM work_items WHERE id = $1",
        )
        .bind(entry.work_item_id)
        .fetch_optional(&mut **tx)
        .await?;
        let Some(work_item) = work_item else {
            return Ok(None);
        };

        // (3) Approval Gate admits the work item.
        if !self.approval_gate.admits(work_item.id).await? {
            return Ok(None);
        }

        // (4) Quota Meter admits the project.
        let project: Option<Project> = sqlx::query_as(
            "SELECT id, name, description, quota_window_seconds, quota_max_runs, created_at, updated_at
             FROM projects WHERE id = $1",
        )
        .bind(work_item.project_id)
        .fetch_optional(&mut **tx)
        .await?;
        let Some(project) = project else {
            return Ok(None);
        };
        let fake_now = crate::clock::FakeClock::new(now);
        if !self
            .quota_meter
            .admits(project.id, &project.quota(), &fake_now, &mut **tx)
            .await?
        {
            return Ok(None);
        }

        // (5) No other Run for this work item is currently running.
        let running: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM runs WHERE work_item_id = $1 AND state = 'running'",
        )
        .bind(work_item.id)
        .fetch_one(&mut **tx)
        .await?;
        if running > 0 {
            return Ok(None);
        }

        // All predicates hold: consume the entry and create the run.
        let result = sqlx::query(
            "UPDATE queue_entries SET state = 'consumed' WHERE id = $1 AND state = 'queued'",
        )
        .bind(entry.id)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            // Raced with another consumer of the same row within this pass;
            // `FOR UPDATE SKIP LOCKED` should make this unreachable, but
            // stay defensive rather than double-promote.
            return Ok(None);
        }

        // Attempt numbering is a lifetime counter across every Run this
        // work item has ever had, not just this one: a retry requeue after
        // an explicit failure produces a brand new Run row, and the Retry
        // Policy's budget check only holds across the work item's lifetime
        // if that row remembers it's attempt N+1, not attempt 1 again.
        let prior_runs: i64 = sqlx::query_scalar("SELECT count(*) FROM runs WHERE work_item_id = $1")
            .bind(work_item.id)
            .fetch_one(&mut **tx)
            .await?;

        let run = Run::builder()
            .work_item_id(work_item.id)
            .state(RunState::Queued)
            .attempt(prior_runs as i32 + 1)
            .trace_id(Uuid::new_v4())
            .build();

        sqlx::query(
            "INSERT INTO runs (id, work_item_id, state, attempt, trace_id)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id)
        .bind(run.work_item_id)
        .bind(run.state)
        .bind(run.attempt)
        .bind(run.trace_id)
        .execute(&mut **tx)
        .await?;

        Ok(Some(PromotedRun {
            queue_entry_id: entry.id,
            run_id: run.id,
            work_item_id: work_item.id,
        }))
    }
}

/// Drives `tick()` on a fixed cadence, tolerating transient Store errors
/// with bounded retry, never overlapping two ticks.
pub async fn run_background_tick_loop(
    scheduler: Scheduler,
    clock: std::sync::Arc<dyn Clock>,
    interval: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let single_flight = tokio::sync::Mutex::new(());
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let _guard = single_flight.lock().await;
                let mut attempts = 0;
                loop {
                    match scheduler.tick(clock.as_ref()).await {
                        Ok(summary) => {
                            if !summary.promoted.is_empty() {
                                tracing::info!(promoted = summary.promoted.len(), "scheduler tick promoted runs");
                            }
                            break;
                        }
                        Err(AppError::Transient(msg)) if attempts < 3 => {
                            attempts += 1;
                            tracing::warn!(attempt = attempts, error = %msg, "transient tick failure, retrying");
                            tokio::time::sleep(std::time::Duration::from_millis(200 * attempts as u64)).await;
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "scheduler tick failed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
