//! Claim/heartbeat lease manager.
//!
//! Each operation is a single conditional `UPDATE ... WHERE ...` so the
//! precondition check and the mutation happen atomically under Postgres's
//! row lock, encoding the state-machine guard directly in the `WHERE`
//! clause instead of a separate `SELECT ... FOR UPDATE` round trip.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::log_bus::{LogBus, LogBusEvent};
use crate::model::{LogEntry, LogStream, Run, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted { claim_expires_at: DateTime<Utc> },
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok { claim_expires_at: DateTime<Utc> },
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Ok,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

#[derive(Clone)]
pub struct LeaseManager {
    pool: PgPool,
    bus: LogBus,
}

impl LeaseManager {
    pub fn new(pool: PgPool, bus: LogBus) -> Self {
        Self { pool, bus }
    }

    /// Atomically grants a lease if the run is `queued`, or if it is
    /// `running` but its claim has expired (a reclaim, which bumps
    /// `attempt`). Any other state returns `Busy`.
    pub async fn claim(
        &self,
        run_id: Uuid,
        agent_id: &str,
        ttl: chrono::Duration,
        clock: &dyn Clock,
    ) -> Result<ClaimOutcome, AppError> {
        let now = clock.now();
        let expires_at = now + ttl;

        let mut tx = self.pool.begin().await?;

        let run: Option<Run> = sqlx::query_as(
            "SELECT id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                    duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at
             FROM runs WHERE id = $1 FOR UPDATE",
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run) = run else {
            return Err(AppError::NotFound(format!("run {run_id}")));
        };

        let claimable = match run.state {
            RunState::Queued => true,
            RunState::Running => run.claim_expires_at.map(|e| e <= now).unwrap_or(false),
            _ => false,
        };

        if !claimable {
            return Ok(ClaimOutcome::Busy);
        }

        let is_reclaim = run.state == RunState::Running;
        let next_attempt = if is_reclaim { run.attempt + 1 } else { run.attempt };
        let started_at = run.started_at.unwrap_or(now);

        sqlx::query(
            "UPDATE runs SET state = 'running', claimed_by = $1, claim_expires_at = $2,
                    started_at = $3, last_heartbeat_at = $4, attempt = $5
             WHERE id = $6",
        )
        .bind(agent_id)
        .bind(expires_at)
        .bind(started_at)
        .bind(now)
        .bind(next_attempt)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ClaimOutcome::Granted {
            claim_expires_at: expires_at,
        })
    }

    /// Extends the lease only if `agent_id` still holds it and the run is
    /// still `running`; otherwise the agent must stop.
    pub async fn heartbeat(
        &self,
        run_id: Uuid,
        agent_id: &str,
        ttl: chrono::Duration,
        clock: &dyn Clock,
    ) -> Result<HeartbeatOutcome, AppError> {
        let now = clock.now();
        let expires_at = now + ttl;

        let result = sqlx::query(
            "UPDATE runs SET claim_expires_at = $1, last_heartbeat_at = $2
             WHERE id = $3 AND claimed_by = $4 AND state = 'running'",
        )
        .bind(expires_at)
        .bind(now)
        .bind(run_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(HeartbeatOutcome::Lost)
        } else {
            Ok(HeartbeatOutcome::Ok {
                claim_expires_at: expires_at,
            })
        }
    }

    /// Transitions the run to a terminal state and clears the claim.
    /// Rejected if `agent_id` is not the current holder.
    pub async fn release(
        &self,
        run_id: Uuid,
        agent_id: &str,
        outcome: RunOutcome,
        clock: &dyn Clock,
    ) -> Result<ReleaseOutcome, AppError> {
        let now = clock.now();
        let target_state = match outcome {
            RunOutcome::Succeeded => RunState::Succeeded,
            RunOutcome::Failed => RunState::Failed,
        };

        let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "UPDATE runs SET state = $1, finished_at = $2,
                    duration_seconds = EXTRACT(EPOCH FROM ($2 - started_at)),
                    claimed_by = NULL, claim_expires_at = NULL
             WHERE id = $3 AND claimed_by = $4 AND state = 'running'
             RETURNING started_at",
        )
        .bind(target_state)
        .bind(now)
        .bind(run_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(_) => ReleaseOutcome::Ok,
            None => ReleaseOutcome::Lost,
        })
    }

    /// Periodic reclaim: runs still `running` whose claim has lapsed move
    /// back to `queued` (bumping `attempt`), subject to the caller's retry
    /// budget decision. Uses `FOR UPDATE SKIP LOCKED` so a concurrent claim
    /// racing the same run is never blocked by this scan.
    ///
    /// `decide` receives the current attempt count (post-increment) and
    /// returns whether a retry budget remains; when it doesn't the run goes
    /// straight to `failed` instead of back to `queued`.
    pub async fn expire_scan<F>(&self, clock: &dyn Clock, mut decide: F) -> Result<usize, AppError>
    where
        F: FnMut(Uuid, i32) -> bool,
    {
        let now = clock.now();
        let mut tx = self.pool.begin().await?;

        let expired: Vec<Run> = sqlx::query_as(
            "SELECT id, work_item_id, state, attempt, trace_id, started_at, finished_at,
                    duration_seconds, claimed_by, claim_expires_at, last_heartbeat_at
             FROM runs
             WHERE state = 'running' AND claim_expires_at < $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = 0usize;
        for run in &expired {
            let next_attempt = run.attempt + 1;
            let budget_remains = decide(run.id, next_attempt);

            if budget_remains {
                sqlx::query(
                    "UPDATE runs SET state = 'queued', claimed_by = NULL, claim_expires_at = NULL,
                            attempt = $1
                     WHERE id = $2",
                )
                .bind(next_attempt)
                .bind(run.id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE runs SET state = 'failed', finished_at = $1,
                            duration_seconds = EXTRACT(EPOCH FROM ($1 - started_at)),
                            claimed_by = NULL, claim_expires_at = NULL, attempt = $2
                     WHERE id = $3",
                )
                .bind(now)
                .bind(next_attempt)
                .bind(run.id)
                .execute(&mut *tx)
                .await?;
            }

            let seq: i64 = sqlx::query_scalar(
                "SELECT coalesce(max(seq), 0) + 1 FROM log_entries WHERE run_id = $1",
            )
            .bind(run.id)
            .fetch_one(&mut *tx)
            .await?;
            let entry = LogEntry {
                run_id: run.id,
                seq,
                timestamp: now,
                stream: LogStream::System,
                text: format!(
                    "lease expired, reclaimed (attempt {next_attempt}, budget_remains={budget_remains})"
                ),
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

            reclaimed += 1;
            self.bus.publish(run.id, LogBusEvent::Log(entry));
        }

        tx.commit().await?;
        Ok(reclaimed)
    }
}
