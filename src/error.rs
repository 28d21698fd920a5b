//! Typed errors for the control plane and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Error kinds the core can surface. Transport framing, auth, and the edge
/// rate limiter map their own errors independently — this enum only covers
/// what the job lifecycle engine itself can produce.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    /// Bad request shape or a referential error (e.g. unknown work_item_id).
    #[error("validation error on `{field}`: {reason}")]
    Validation { field: String, reason: String },

    /// A state-machine violation — completing a terminal run, claiming a
    /// held run, a duplicate step idx. The core never second-guesses these.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Approval, quota, or policy denial.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// Store connectivity or serialization failure that bounded local retry
    /// did not resolve.
    #[error("transient error: {0}")]
    Transient(String),

    /// A bug. Logged with full context, never shown to the caller.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason code, surfaced alongside the status so
    /// clients can distinguish quota/approval denials from generic 409s.
    fn reason_code(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "validation",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden { .. } => "forbidden",
            AppError::Transient(_) => "transient",
            AppError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }

        let status = self.status();
        let reason = self.reason_code();
        let field = match &self {
            AppError::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };

        let message = if matches!(self, AppError::Internal(_)) {
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorBody {
                error: message,
                reason,
                field,
            }),
        )
            .into_response()
    }
}

/// Maps sqlx errors arising mid-transaction to the `transient` kind; callers
/// that need to distinguish "row not found" do so before this conversion
/// runs (e.g. via `fetch_optional`).
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            other => AppError::Transient(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
