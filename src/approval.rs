//! Approval Gate: a boolean global policy that sticks approval per work
//! item, not per run.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::model::{ApprovalRequest, ApprovalState};

#[derive(Clone)]
pub struct ApprovalGate {
    pool: PgPool,
    require_approval: bool,
}

impl ApprovalGate {
    pub fn new(pool: PgPool, require_approval: bool) -> Self {
        Self {
            pool,
            require_approval,
        }
    }

    /// Whether a work item may start: `false` whenever approval is required
    /// and there is a pending request or no approved one.
    pub async fn admits(&self, work_item_id: Uuid) -> Result<bool, AppError> {
        if !self.require_approval {
            return Ok(true);
        }

        let pending: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM approval_requests WHERE work_item_id = $1 AND state = 'pending'",
        )
        .bind(work_item_id)
        .fetch_one(&self.pool)
        .await?;
        if pending > 0 {
            return Ok(false);
        }

        let approved: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM approval_requests WHERE work_item_id = $1 AND state = 'approved'",
        )
        .bind(work_item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(approved > 0)
    }

    pub async fn request(&self, work_item_id: Uuid) -> Result<ApprovalRequest, AppError> {
        let request = ApprovalRequest::builder().work_item_id(work_item_id).build();
        sqlx::query(
            "INSERT INTO approval_requests (id, work_item_id, state, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(request.id)
        .bind(request.work_item_id)
        .bind(request.state)
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(request)
    }

    /// Decides a pending approval request. Terminal states are immutable:
    /// deciding twice is a conflict, not a silent no-op.
    pub async fn decide(
        &self,
        approval_id: Uuid,
        approve: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ApprovalRequest, AppError> {
        let target = if approve {
            ApprovalState::Approved
        } else {
            ApprovalState::Rejected
        };

        let updated: Option<ApprovalRequest> = sqlx::query_as(
            "UPDATE approval_requests SET state = $1, decided_at = $2
             WHERE id = $3 AND state = 'pending'
             RETURNING id, work_item_id, state, created_at, decided_at",
        )
        .bind(target)
        .bind(now)
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(req) => Ok(req),
            None => {
                let exists: Option<ApprovalRequest> = sqlx::query_as(
                    "SELECT id, work_item_id, state, created_at, decided_at FROM approval_requests WHERE id = $1",
                )
                .bind(approval_id)
                .fetch_optional(&self.pool)
                .await?;
                match exists {
                    Some(_) => Err(AppError::Conflict(
                        "approval request already decided".to_string(),
                    )),
                    None => Err(AppError::NotFound(format!(
                        "approval request {approval_id}"
                    ))),
                }
            }
        }
    }
}
