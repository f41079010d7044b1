//! The recovery queue: bounded-retry remediation with escalation.
//!
//! Tasks move through an explicit state machine
//! (`pending -> processing -> {completed | failed | exceeded_attempts}`)
//! and every transition is appended to the task's narrative notes. Claims
//! are compare-and-swap updates in storage, so any number of workers can
//! poll the queue concurrently.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use pacrelay_db::{
    DocumentRef, NewTask, QueueStats, RecoveryTask, RelayDb, RelayError, Result, TaskFilter,
    TaskPriority, TaskStatus, TaskType,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::backoff::retry_delay;
use crate::contracts::DocumentDirectory;

/// Default attempt budget for a new task.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Hard ceiling on the attempt budget.
pub const MAX_ATTEMPTS_CAP: i32 = 5;

/// Role that exhausted tasks are handed to when nobody is assigned.
const ESCALATION_ASSIGNEE: &str = "recovery-admin";

/// How many eligible candidates to examine per claim attempt.
const CLAIM_BATCH: usize = 16;

/// Parameters for opening a recovery task.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub task_type: TaskType,
    pub reference: DocumentRef,
    pub interaction_id: Option<i64>,
    pub priority: TaskPriority,
    /// Earliest processing instant; must be strictly in the future.
    pub scheduled_time: DateTime<Utc>,
    pub max_attempts: i32,
    /// Explicit caller identity recorded as `created_by`.
    pub actor: String,
}

impl EnqueueRequest {
    pub fn new(
        task_type: TaskType,
        reference: DocumentRef,
        scheduled_time: DateTime<Utc>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            task_type,
            reference,
            interaction_id: None,
            priority: TaskPriority::Medium,
            scheduled_time,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            actor: actor.into(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_interaction(mut self, interaction_id: i64) -> Self {
        self.interaction_id = Some(interaction_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Operator-facing snapshot of a task. Shown on dashboards; carries no raw
/// storage rows and no stack traces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusSummary {
    pub task_id: i64,
    pub task_type: TaskType,
    pub reference: DocumentRef,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub escalated: bool,
    pub assigned_to: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Bounded-retry task queue over the shared relay database.
#[derive(Clone)]
pub struct RecoveryQueue {
    db: RelayDb,
    documents: Arc<dyn DocumentDirectory>,
}

impl RecoveryQueue {
    pub fn new(db: RelayDb, documents: Arc<dyn DocumentDirectory>) -> Self {
        Self { db, documents }
    }

    pub fn db(&self) -> &RelayDb {
        &self.db
    }

    /// Open a new recovery task.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<RecoveryTask> {
        if req.scheduled_time <= Utc::now() {
            return Err(RelayError::validation(
                "scheduled_time must be strictly in the future".to_string(),
            ));
        }
        if req.max_attempts < 1 || req.max_attempts > MAX_ATTEMPTS_CAP {
            return Err(RelayError::validation(format!(
                "max_attempts must be between 1 and {}",
                MAX_ATTEMPTS_CAP
            )));
        }
        if !self.documents.exists(&req.reference).await {
            return Err(RelayError::validation(format!(
                "referenced record {} does not exist",
                req.reference
            )));
        }
        if self
            .db
            .recovery_active_exists(&req.reference, req.task_type)
            .await?
        {
            return Err(RelayError::validation(format!(
                "an active {} task already exists for {}",
                req.task_type, req.reference
            )));
        }

        let new = NewTask {
            task_type: req.task_type,
            reference: req.reference.clone(),
            interaction_id: req.interaction_id,
            priority: req.priority,
            max_attempts: req.max_attempts,
            scheduled_time_ms: req.scheduled_time.timestamp_millis(),
            created_by: req.actor.clone(),
            initial_note: note_line(&format!(
                "task opened by {} (type={}, priority={})",
                req.actor, req.task_type, req.priority
            )),
        };

        let id = self.db.recovery_insert(&new).await?;
        info!(
            task_id = id,
            task_type = %req.task_type,
            reference = %req.reference,
            priority = %req.priority,
            "Recovery task enqueued"
        );
        self.get(id).await
    }

    /// Get a task, failing with NotFound if absent.
    pub async fn get(&self, id: i64) -> Result<RecoveryTask> {
        self.db
            .recovery_get(id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("recovery task {}", id)))
    }

    /// Is there a live task for this (reference, task_type) pair?
    pub async fn has_active(&self, reference: &DocumentRef, task_type: TaskType) -> Result<bool> {
        self.db.recovery_active_exists(reference, task_type).await
    }

    /// Claim a task for processing (`pending -> processing`).
    ///
    /// The claim is a compare-and-swap on the stored status; out of any
    /// number of racing workers exactly one sees `Ok`.
    pub async fn claim(&self, task: &RecoveryTask) -> Result<RecoveryTask> {
        if !task.status.can_transition(TaskStatus::Processing) {
            return Err(RelayError::validation(format!(
                "illegal transition {} -> processing for task {}",
                task.status, task.id
            )));
        }

        let claimed = self
            .db
            .recovery_claim(task.id, RelayDb::now_millis())
            .await?;
        if !claimed {
            return Err(RelayError::validation(format!(
                "task {} is no longer pending",
                task.id
            )));
        }
        self.get(task.id).await
    }

    /// Resolve a claimed task successfully.
    pub async fn succeed(
        &self,
        task_id: i64,
        resolution_notes: Option<&str>,
    ) -> Result<RecoveryTask> {
        let task = self.get(task_id).await?;
        if !task.status.can_transition(TaskStatus::Completed) {
            return Err(RelayError::validation(format!(
                "illegal transition {} -> completed for task {}",
                task.status, task_id
            )));
        }

        let note = note_line(&format!(
            "resolved: {}",
            resolution_notes.unwrap_or("completed")
        ));
        let updated = self
            .db
            .recovery_mark_completed(task_id, &note, RelayDb::now_millis())
            .await?;
        if !updated {
            return Err(RelayError::validation(format!(
                "task {} is not processing",
                task_id
            )));
        }

        let task = self.get(task_id).await?;
        self.documents.on_task_resolved(&task).await;
        Ok(task)
    }

    /// Record a failed attempt on a claimed task.
    ///
    /// Counts the attempt, then either re-enqueues with backoff
    /// (`should_retry`), parks the task as `failed` for manual re-enqueue,
    /// or escalates to `exceeded_attempts` once the budget is spent.
    pub async fn fail(
        &self,
        task_id: i64,
        error_message: &str,
        error_details: Option<&str>,
        should_retry: bool,
    ) -> Result<RecoveryTask> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::Processing {
            return Err(RelayError::validation(format!(
                "illegal transition {} -> failed for task {}",
                task.status, task_id
            )));
        }

        let attempts = task.attempts + 1;
        let now = Utc::now();

        let (status, scheduled_time, escalated, note) = if attempts >= task.max_attempts {
            (
                TaskStatus::ExceededAttempts,
                task.scheduled_time,
                true,
                format!(
                    "attempt {}/{} failed: {}; attempts exhausted, escalated to {}",
                    attempts, task.max_attempts, error_message, ESCALATION_ASSIGNEE
                ),
            )
        } else if should_retry {
            let next = now + retry_delay(attempts, task.priority);
            (
                TaskStatus::Pending,
                next,
                false,
                format!(
                    "attempt {}/{} failed: {}; retrying at {}",
                    attempts,
                    task.max_attempts,
                    error_message,
                    next.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            )
        } else {
            (
                TaskStatus::Failed,
                task.scheduled_time,
                false,
                format!(
                    "attempt {}/{} failed: {}; not retryable, awaiting manual re-enqueue",
                    attempts, task.max_attempts, error_message
                ),
            )
        };

        let mut note = note;
        if let Some(details) = error_details {
            note.push_str(&format!(" [{}]", details));
        }

        let updated = self
            .db
            .recovery_apply_failure(
                task_id,
                status,
                attempts,
                scheduled_time.timestamp_millis(),
                error_message,
                escalated,
                Some(ESCALATION_ASSIGNEE),
                &note_line(&note),
            )
            .await?;
        if !updated {
            return Err(RelayError::validation(format!(
                "task {} is not processing",
                task_id
            )));
        }

        if escalated {
            warn!(
                task_id,
                attempts,
                error = error_message,
                "Recovery task exhausted its attempts, escalating"
            );
        } else {
            info!(
                task_id,
                attempts,
                status = %status,
                error = error_message,
                "Recovery attempt failed"
            );
        }

        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            self.documents.on_task_resolved(&task).await;
        }
        Ok(task)
    }

    /// Manually put a parked (`failed`) task back in contention.
    pub async fn requeue(&self, task_id: i64, actor: &str) -> Result<RecoveryTask> {
        let task = self.get(task_id).await?;
        if !task.status.can_transition(TaskStatus::Pending) {
            return Err(RelayError::validation(format!(
                "illegal transition {} -> pending for task {}",
                task.status, task_id
            )));
        }

        let note = note_line(&format!("re-enqueued by {}", actor));
        let updated = self
            .db
            .recovery_requeue(task_id, RelayDb::now_millis(), &note)
            .await?;
        if !updated {
            return Err(RelayError::validation(format!(
                "task {} is not in a re-enqueueable state",
                task_id
            )));
        }
        self.get(task_id).await
    }

    /// All pending tasks whose schedule has come due, best first.
    pub async fn dequeue_eligible(&self, now: DateTime<Utc>) -> Result<Vec<RecoveryTask>> {
        self.db
            .recovery_dequeue_eligible(now.timestamp_millis(), None, None)
            .await
    }

    /// Claim the best eligible task, racing fairly against other workers.
    ///
    /// Walks the eligible list in order and returns the first task whose
    /// claim this worker wins; `None` when the queue has nothing due.
    pub async fn claim_next_eligible(
        &self,
        now: DateTime<Utc>,
        handled_types: Option<&[TaskType]>,
    ) -> Result<Option<RecoveryTask>> {
        let candidates = self
            .db
            .recovery_dequeue_eligible(now.timestamp_millis(), handled_types, Some(CLAIM_BATCH))
            .await?;

        for candidate in candidates {
            if self
                .db
                .recovery_claim(candidate.id, RelayDb::now_millis())
                .await?
            {
                return Ok(Some(self.get(candidate.id).await?));
            }
            // Lost the race for this one; try the next candidate.
        }
        Ok(None)
    }

    /// Operator-facing snapshot of one task.
    pub async fn status_summary(&self, task_id: i64) -> Result<TaskStatusSummary> {
        let task = self.get(task_id).await?;
        Ok(TaskStatusSummary {
            task_id: task.id,
            task_type: task.task_type,
            reference: task.reference,
            status: task.status,
            priority: task.priority,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            last_error: task.last_error,
            escalated: task.escalated,
            assigned_to: task.assigned_to,
            scheduled_time: task.scheduled_time,
            resolved_at: task.resolved_at,
        })
    }

    /// Per-status queue counts.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.db.recovery_stats().await
    }

    /// List tasks for operational tooling.
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<RecoveryTask>> {
        self.db.recovery_list(filter).await
    }
}

fn note_line(msg: &str) -> String {
    format!(
        "[{}] {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        msg
    )
}
