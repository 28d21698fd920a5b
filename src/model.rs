//! The control-plane data model: entities and enums.
//!
//! IDs are UUIDs, instants are `DateTime<Utc>`. Enums with a closed state set
//! map to Postgres enum types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Project
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub window_seconds: i64,
    pub max_runs: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Project {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    #[builder(default = 3600)]
    pub quota_window_seconds: i64,
    #[builder(default = 100)]
    pub quota_max_runs: i64,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn quota(&self) -> Quota {
        Quota {
            window_seconds: self.quota_window_seconds,
            max_runs: self.quota_max_runs,
        }
    }
}

// ============================================================================
// WorkItem
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyOverride {
    pub max_retries: i32,
    pub backoff_base_seconds: f64,
    pub backoff_jitter_seconds: f64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkItem {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    /// Opaque validated recipe value; the core never parses this.
    #[builder(default, setter(strip_option))]
    pub tool_recipe: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub backoff_base_seconds: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub backoff_jitter_seconds: Option<f64>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// ApprovalRequest
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "approval_state", rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ApprovalRequest {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub work_item_id: Uuid,
    #[builder(default)]
    pub state: ApprovalState,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub decided_at: Option<DateTime<Utc>>,
}

// ============================================================================
// QueueEntry (ScheduledTask)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "queue_entry_state", rename_all = "snake_case")]
pub enum QueueEntryState {
    #[default]
    Queued,
    Consumed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct QueueEntry {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub work_item_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub depends_on_work_item_id: Option<Uuid>,
    #[builder(default = 0)]
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub enqueued_at: DateTime<Utc>,
    #[builder(default)]
    pub state: QueueEntryState,
}

// ============================================================================
// Run
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_state", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Run {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub work_item_id: Uuid,
    #[builder(default)]
    pub state: RunState,
    #[builder(default = 1)]
    pub attempt: i32,
    #[builder(default = Uuid::new_v4())]
    pub trace_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub duration_seconds: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub claimed_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub claim_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

// ============================================================================
// RunStep
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_step_status", rename_all = "snake_case")]
pub enum RunStepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct RunStep {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub run_id: Uuid,
    pub idx: i32,
    pub name: String,
    #[builder(default)]
    pub status: RunStepStatus,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub duration_seconds: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// LogEntry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "log_stream", rename_all = "snake_case")]
pub enum LogStream {
    #[default]
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: Uuid,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

// ============================================================================
// InfoRequest
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "info_request_state", rename_all = "snake_case")]
pub enum InfoRequestState {
    #[default]
    Pending,
    Answered,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoRequestKey {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub secret: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct InfoRequest {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub run_id: Uuid,
    /// Serialized `Vec<InfoRequestKey>`.
    pub keys: serde_json::Value,
    #[builder(default)]
    pub state: InfoRequestState,
    /// Present when the response was stored in plaintext.
    #[builder(default, setter(strip_option))]
    pub response: Option<serde_json::Value>,
    /// Present when the response was stored encrypted-at-rest. The core
    /// never interprets these bytes beyond opaque storage.
    #[builder(default, setter(strip_option))]
    pub response_encrypted: Option<Vec<u8>>,
    #[builder(default, setter(strip_option))]
    pub cipher_tag: Option<String>,
    #[builder(default, setter(strip_option))]
    pub nonce: Option<Vec<u8>>,
}

impl InfoRequest {
    pub fn required_keys(&self) -> Vec<InfoRequestKey> {
        serde_json::from_value(self.keys.clone()).unwrap_or_default()
    }
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub last_seen_at: DateTime<Utc>,
}
