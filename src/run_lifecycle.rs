//! Run Lifecycle: state machine, step ingestion, completion, re-queue on
//! failure.

use sqlx::PgPool;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::lease::{LeaseManager, ReleaseOutcome, RunOutcome};
use crate::log_bus::{LogBus, LogBusEvent};
use crate::model::{LogEntry, LogStream, Run, RunState, RunStep, RunStepStatus, WorkItem};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct RunLifecycle {
    pool: PgPool,
    bus: LogBus,
    lease_manager: LeaseManager,
    scheduler: Scheduler,
    default_retry_policy: RetryPolicy,
}

impl RunLifecycle {
    pub fn new(
        pool: PgPool,
        bus: LogBus,
        lease_manager: LeaseManager,
        scheduler: Scheduler,
        default_retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            bus,
            lease_manager,
            scheduler,
            default_retry_policy,
        }
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, AppError> {
        let run: Option<Run> = sqlx::query_as(
            "SELECT id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                    duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at
             FROM runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        run.ok_or_else(|| AppError::NotFound(format!("run {run_id}")))
    }

    pub async fn list_runs(&self, work_item_id: Uuid) -> Result<Vec<Run>, AppError> {
        let rows = sqlx::query_as(
            "SELECT id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                    duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at
             FROM runs WHERE work_item_id = $1 ORDER BY id DESC",
        )
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Assigns the next per-run `seq`, persists, and publishes on the Log
    /// Bus. If persistence fails, the fan-out does not fire for that entry.
    pub async fn append_log(
        &self,
        run_id: Uuid,
        stream: LogStream,
        text: String,
        clock: &dyn Clock,
    ) -> Result<LogEntry, AppError> {
        let mut tx = self.pool.begin().await?;

        // `FOR UPDATE` can't sit on an aggregate select, so lock the parent
        // `runs` row instead: that serializes concurrent appends for this
        // run_id without needing it on the `max(seq)` query itself.
        sqlx::query("SELECT 1 FROM runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;

        let seq: i64 =
            sqlx::query_scalar("SELECT coalesce(max(seq), 0) + 1 FROM log_entries WHERE run_id = $1")
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await?;

        let entry = LogEntry {
            run_id,
            seq,
            timestamp: clock.now(),
            stream,
            text,
        };

        sqlx::query(
            "INSERT INTO log_entries (run_id, seq, timestamp, stream, text) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.run_id)
        .bind(entry.seq)
        .bind(entry.timestamp)
        .bind(entry.stream)
        .bind(&entry.text)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.bus.publish(run_id, LogBusEvent::Log(entry.clone()));
        Ok(entry)
    }

    pub async fn list_logs(
        &self,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LogEntry>, AppError> {
        let rows = sqlx::query_as(
            "SELECT run_id, seq, timestamp, stream, text FROM log_entries
             WHERE run_id = $1 ORDER BY seq ASC LIMIT $2 OFFSET $3",
        )
        .bind(run_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// `idx` must be unique and dense per run: the first step must be 0 and
    /// each subsequent step's idx must be the current count (no gaps).
    pub async fn create_step(
        &self,
        run_id: Uuid,
        idx: i32,
        name: String,
    ) -> Result<RunStep, AppError> {
        let mut tx = self.pool.begin().await?;

        // Same reasoning as `append_log`: lock the parent `runs` row rather
        // than putting `FOR UPDATE` on a `count(*)` aggregate, which Postgres
        // rejects outright.
        sqlx::query("SELECT 1 FROM runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM run_steps WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await?;

        if idx as i64 != count {
            return Err(AppError::Conflict(format!(
                "step idx {idx} is not dense; expected {count}"
            )));
        }

        let step = RunStep::builder().run_id(run_id).idx(idx).name(name).build();

        sqlx::query(
            "INSERT INTO run_steps (id, run_id, idx, name, status) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(step.id)
        .bind(step.run_id)
        .bind(step.idx)
        .bind(&step.name)
        .bind(step.status)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.bus.publish(run_id, LogBusEvent::Step(step.clone()));
        Ok(step)
    }

    pub async fn update_step(
        &self,
        step_id: Uuid,
        status: RunStepStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        finished_at: Option<chrono::DateTime<chrono::Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<RunStep, AppError> {
        let duration_seconds = match (started_at, finished_at) {
            (Some(s), Some(f)) => Some((f - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };

        let step: Option<RunStep> = sqlx::query_as(
            "UPDATE run_steps SET status = $1, started_at = coalesce($2, started_at),
                    finished_at = coalesce($3, finished_at), duration_seconds = coalesce($4, duration_seconds),
                    metadata = coalesce($5, metadata)
             WHERE id = $6
             RETURNING id, run_id, idx, name, status, started_at, finished_at, duration_seconds, metadata",
        )
        .bind(status)
        .bind(started_at)
        .bind(finished_at)
        .bind(duration_seconds)
        .bind(metadata)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        let step = step.ok_or_else(|| AppError::NotFound(format!("run step {step_id}")))?;
        self.bus.publish(step.run_id, LogBusEvent::Step(step.clone()));
        Ok(step)
    }

    pub async fn list_steps(&self, run_id: Uuid) -> Result<Vec<RunStep>, AppError> {
        let rows = sqlx::query_as(
            "SELECT id, run_id, idx, name, status, started_at, finished_at, duration_seconds, metadata
             FROM run_steps WHERE run_id = $1 ORDER BY idx ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Releases the lease and, on failure with retry budget remaining,
    /// schedules a fresh `QueueEntry` via the Retry Policy. A second
    /// `complete` on an already-terminal run is a conflict and mutates
    /// nothing (idempotent-completion property).
    pub async fn complete(
        &self,
        run_id: Uuid,
        agent_id: &str,
        success: bool,
        clock: &dyn Clock,
    ) -> Result<Run, AppError> {
        let outcome = if success {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };

        let release = self
            .lease_manager
            .release(run_id, agent_id, outcome, clock)
            .await?;

        if release == ReleaseOutcome::Lost {
            return Err(AppError::Conflict(format!(
                "run {run_id} is not held by {agent_id} or is already terminal"
            )));
        }

        let run = self.get_run(run_id).await?;

        if !success {
            self.maybe_schedule_retry(&run, clock).await?;
        }

        Ok(run)
    }

    async fn maybe_schedule_retry(&self, run: &Run, clock: &dyn Clock) -> Result<(), AppError> {
        let work_item: Option<WorkItem> = sqlx::query_as(
            "SELECT id, project_id, title, description, tool_recipe, max_retries,
                    backoff_base_seconds, backoff_jitter_seconds, created_at, updated_at
             FROM work_items WHERE id = $1",
        )
        .bind(run.work_item_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(work_item) = work_item else {
            return Ok(());
        };

        let policy = RetryPolicy::for_work_item(self.default_retry_policy, &work_item);

        if policy.budget_remains(run.attempt) {
            let delay = policy.delay_seconds(run.attempt);
            self.scheduler
                .requeue_work_item(run.work_item_id, 0, delay.round() as i64, clock)
                .await?;
        }

        Ok(())
    }

    /// Forces a terminal `cancelled` state, regardless of current state,
    /// and never triggers the Retry Policy.
    pub async fn cancel(&self, run_id: Uuid, clock: &dyn Clock) -> Result<Run, AppError> {
        let now = clock.now();

        let run: Option<Run> = sqlx::query_as(
            "UPDATE runs SET state = 'cancelled', finished_at = $1,
                    duration_seconds = EXTRACT(EPOCH FROM ($1 - started_at)),
                    claimed_by = NULL, claim_expires_at = NULL
             WHERE id = $2 AND state NOT IN ('succeeded', 'failed', 'cancelled')
             RETURNING id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                       duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at",
        )
        .bind(now)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match run {
            Some(run) => Ok(run),
            None => {
                let existing = self.get_run(run_id).await?;
                if existing.state.is_terminal() {
                    Err(AppError::Conflict(format!("run {run_id} is already terminal")))
                } else {
                    Err(AppError::Internal(anyhow::anyhow!(
                        "unexpected: cancel failed for non-terminal run {run_id}"
                    )))
                }
            }
        }
    }
}

/// Lease-expiry reclaim path: delegates the retry-budget decision to the
/// same `RetryPolicy` the rest of the engine uses, so an expired claim
/// counts as a retry exactly like an explicit failure does.
impl RunLifecycle {
    pub async fn expire_scan(&self, clock: &dyn Clock) -> Result<usize, AppError> {
        let pool = self.pool.clone();
        let default_policy = self.default_retry_policy;

        let mut budgets: std::collections::HashMap<Uuid, bool> = std::collections::HashMap::new();

        // Pre-fetch attempt -> policy decisions require the run's work item,
        // looked up per-run inside the closure below via a blocking-free
        // synchronous cache populated ahead of time is not possible with
        // async closures in `FnMut`; instead the lease manager calls back
        // per run id with the post-increment attempt number, and we resolve
        // the policy synchronously from a pre-warmed map built here.
        let running_runs: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "SELECT id, work_item_id FROM runs WHERE state = 'running' AND claim_expires_at < $1",
        )
        .bind(clock.now())
        .fetch_all(&pool)
        .await?;

        for (run_id, work_item_id) in running_runs {
            let work_item: Option<WorkItem> = sqlx::query_as(
                "SELECT id, project_id, title, description, tool_recipe, max_retries,
                        backoff_base_seconds, backoff_jitter_seconds, created_at, updated_at
                 FROM work_items WHERE id = $1",
            )
            .bind(work_item_id)
            .fetch_optional(&pool)
            .await?;

            let policy = match &work_item {
                Some(wi) => RetryPolicy::for_work_item(default_policy, wi),
                None => default_policy,
            };

            let run: Option<Run> = sqlx::query_as(
                "SELECT id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                        duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at
                 FROM runs WHERE id = $1",
            )
            .bind(run_id)
            .fetch_optional(&pool)
            .await?;

            let remains = run
                .map(|r| policy.budget_remains(r.attempt + 1))
                .unwrap_or(false);
            budgets.insert(run_id, remains);
        }

        let reclaimed = self
            .lease_manager
            .expire_scan(clock, |run_id, _next_attempt| {
                budgets.get(&run_id).copied().unwrap_or(false)
            })
            .await?;

        Ok(reclaimed)
    }
}

