//! Row types for the interaction ledger and the recovery queue.
//!
//! These types are the single source of truth. Every layer above the
//! database (domain APIs, worker, operator tooling) uses them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Shared
// ============================================================================

/// Reference to the originating business record an interaction or task is
/// about. This is the only thing the relay knows about business documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub doctype: String,
    pub name: String,
}

impl DocumentRef {
    pub fn new(doctype: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            doctype: doctype.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.doctype, self.name)
    }
}

// ============================================================================
// Interaction Ledger Types
// ============================================================================

/// Kind of outbound PAC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Stamp (certify) a fiscal document.
    Stamp,
    /// Cancel a previously stamped document.
    Cancel,
    /// Query the PAC for the status of a prior request.
    StatusQuery,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stamp => "stamp",
            Self::Cancel => "cancel",
            Self::StatusQuery => "status_query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "stamp" => Some(Self::Stamp),
            "cancel" => Some(Self::Cancel),
            "status_query" => Some(Self::StatusQuery),
            _ => None,
        }
    }

    /// Stamp and cancel act on a specific document; a status query may not.
    pub fn requires_reference(&self) -> bool {
        matches!(self, Self::Stamp | Self::Cancel)
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row in the interaction ledger: a single request/response attempt
/// against the PAC. Rows are immutable once the response fields are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    pub id: i64,
    /// Globally unique idempotency key, generated once per logical request.
    pub request_id: String,
    pub request_type: RequestType,
    pub reference: Option<DocumentRef>,
    pub request_timestamp: DateTime<Utc>,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub response_http_code: Option<i32>,
    pub system_error: Option<String>,
    /// Millisecond delta between request and response, computed once.
    pub response_time_ms: Option<i64>,
    pub timeout_flag: bool,
    /// Back-reference to the prior record in a retry chain.
    pub retry_of: Option<i64>,
    /// 0 on the first attempt, 1..=3 along a retry chain.
    pub retry_count: i32,
    /// Explicit caller identity, never ambient state.
    pub created_by: String,
}

impl InteractionRecord {
    /// A record is frozen once its response fields are set.
    pub fn is_completed(&self) -> bool {
        self.response_timestamp.is_some()
    }

    pub fn is_retry(&self) -> bool {
        self.retry_of.is_some()
    }
}

/// Parameters for inserting a ledger row.
#[derive(Debug, Clone)]
pub struct NewInteraction {
    pub request_id: String,
    pub request_type: RequestType,
    pub reference: Option<DocumentRef>,
    pub request_timestamp_ms: i64,
    pub request_payload: Option<String>,
    pub retry_of: Option<i64>,
    pub retry_count: i32,
    pub created_by: String,
}

/// One privileged-override audit entry. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub interaction_id: i64,
    pub operator: String,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Recovery Queue Types
// ============================================================================

/// Kind of remediation work a recovery task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A PAC call exceeded the response deadline; the outcome is unknown.
    TimeoutRecovery,
    /// A PAC call failed with a transient error and must be re-driven.
    SyncError,
    /// An operator must intervene by hand.
    ManualFix,
    /// A business record and the ledger disagree about document state.
    StateCorruption,
    /// A PAC response arrived for a request the ledger cannot match.
    OrphanedResponse,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeoutRecovery => "timeout_recovery",
            Self::SyncError => "sync_error",
            Self::ManualFix => "manual_fix",
            Self::StateCorruption => "state_corruption",
            Self::OrphanedResponse => "orphaned_response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "timeout_recovery" => Some(Self::TimeoutRecovery),
            "sync_error" => Some(Self::SyncError),
            "manual_fix" => Some(Self::ManualFix),
            "state_corruption" => Some(Self::StateCorruption),
            "orphaned_response" => Some(Self::OrphanedResponse),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a recovery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    ExceededAttempts,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ExceededAttempts => "exceeded_attempts",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "exceeded_attempts" => Some(Self::ExceededAttempts),
            _ => None,
        }
    }

    /// Terminal tasks are never reopened; a fresh task must be created.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::ExceededAttempts)
    }

    /// The full transition table. `processing -> pending` is the re-enqueue
    /// edge taken when a claimed attempt fails and a retry is allowed;
    /// `failed -> pending` is the manual re-enqueue edge.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, ExceededAttempts)
                | (Failed, Pending)
                | (Failed, ExceededAttempts)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduling priority. High-priority tasks are serviced first and use half
/// the computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Sort rank for dequeue ordering (lower is served first).
    pub fn rank(&self) -> i32 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of remediation work, tracked through a bounded-retry state
/// machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTask {
    pub id: i64,
    pub task_type: TaskType,
    pub reference: DocumentRef,
    /// The ledger row this task is trying to recover, when there is one.
    pub interaction_id: Option<i64>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// 0-based attempt counter.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Earliest instant the task becomes eligible for processing.
    pub scheduled_time: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub escalated: bool,
    pub assigned_to: Option<String>,
    /// Append-only narrative of every transition and failure reason.
    pub processing_notes: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Parameters for inserting a recovery task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub reference: DocumentRef,
    pub interaction_id: Option<i64>,
    pub priority: TaskPriority,
    pub max_attempts: i32,
    pub scheduled_time_ms: i64,
    pub created_by: String,
    pub initial_note: String,
}

/// Filter for listing recovery tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub escalated_only: bool,
    pub limit: Option<usize>,
}

/// Per-status queue counts for operational tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub exceeded_attempts: u64,
}
