//! Recovery queue storage operations.
//!
//! Claiming and every other status change is a conditional UPDATE guarded by
//! the current status, so racing workers cannot both win and illegal jumps
//! cannot be written, no matter what the caller computed in memory.

use crate::error::{RelayError, Result};
use crate::types::*;
use crate::RelayDb;
use sqlx::Row;
use tracing::info;

impl RelayDb {
    // ========================================================================
    // Recovery Queue Operations
    // ========================================================================

    /// Insert a new recovery task.
    pub async fn recovery_insert(&self, new: &NewTask) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO pac_recovery_queue
                (task_type, reference_doctype, reference_name, interaction_id,
                 status, priority, max_attempts, scheduled_time,
                 processing_notes, created_by, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.task_type.as_str())
        .bind(&new.reference.doctype)
        .bind(&new.reference.name)
        .bind(new.interaction_id)
        .bind(new.priority.as_str())
        .bind(new.max_attempts)
        .bind(new.scheduled_time_ms)
        .bind(&new.initial_note)
        .bind(&new.created_by)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| map_active_task_violation(e, &new.reference, new.task_type))?;

        Ok(result.last_insert_rowid())
    }

    /// Get a task by ID.
    pub async fn recovery_get(&self, id: i64) -> Result<Option<RecoveryTask>> {
        let row = sqlx::query("SELECT * FROM pac_recovery_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    /// Does a live (pending/processing) task already exist for this
    /// (reference, task_type) pair?
    pub async fn recovery_active_exists(
        &self,
        reference: &DocumentRef,
        task_type: TaskType,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM pac_recovery_queue
            WHERE reference_doctype = ? AND reference_name = ? AND task_type = ?
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(&reference.doctype)
        .bind(&reference.name)
        .bind(task_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Atomically claim a task (pending -> processing).
    ///
    /// Returns `false` when another worker won the race or the task is no
    /// longer pending.
    pub async fn recovery_claim(&self, id: i64, now_ms: i64) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE pac_recovery_queue
            SET status = 'processing',
                last_attempt = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Mark a claimed task completed.
    pub async fn recovery_mark_completed(
        &self,
        id: i64,
        note_line: &str,
        resolved_ms: i64,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE pac_recovery_queue
            SET status = 'completed',
                resolved_at = ?,
                processing_notes = processing_notes || ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(resolved_ms)
        .bind(note_line)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            info!(task_id = id, "Recovery task completed");
        }
        Ok(rows_affected > 0)
    }

    /// Apply the outcome of a failed attempt computed by the domain layer.
    ///
    /// `status` is one of pending (re-enqueued), failed, or
    /// exceeded_attempts. The update only lands while the task is still
    /// claimed; `assigned_to` is never overwritten once set.
    #[allow(clippy::too_many_arguments)]
    pub async fn recovery_apply_failure(
        &self,
        id: i64,
        status: TaskStatus,
        attempts: i32,
        scheduled_time_ms: i64,
        last_error: &str,
        escalated: bool,
        assign_to: Option<&str>,
        note_line: &str,
    ) -> Result<bool> {
        let resolved_ms = if status.is_terminal() {
            Some(Self::now_millis())
        } else {
            None
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE pac_recovery_queue
            SET status = ?,
                attempts = ?,
                scheduled_time = ?,
                last_error = ?,
                escalated = CASE WHEN ? THEN 1 ELSE escalated END,
                assigned_to = COALESCE(assigned_to, ?),
                resolved_at = COALESCE(?, resolved_at),
                processing_notes = processing_notes || ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(status.as_str())
        .bind(attempts)
        .bind(scheduled_time_ms)
        .bind(last_error)
        .bind(escalated as i32)
        .bind(if escalated { assign_to } else { None })
        .bind(resolved_ms)
        .bind(note_line)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Re-enqueue a terminally failed task (failed -> pending). Manual path.
    pub async fn recovery_requeue(
        &self,
        id: i64,
        scheduled_time_ms: i64,
        note_line: &str,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE pac_recovery_queue
            SET status = 'pending',
                scheduled_time = ?,
                processing_notes = processing_notes || ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(scheduled_time_ms)
        .bind(note_line)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// All pending tasks whose schedule has come due, best first: high
    /// priority before medium before low, ties broken by earliest schedule.
    pub async fn recovery_dequeue_eligible(
        &self,
        now_ms: i64,
        task_types: Option<&[TaskType]>,
        limit: Option<usize>,
    ) -> Result<Vec<RecoveryTask>> {
        let mut sql = String::from(
            "SELECT * FROM pac_recovery_queue WHERE status = 'pending' AND scheduled_time <= ?",
        );

        if let Some(types) = task_types {
            let list = types
                .iter()
                .map(|t| format!("'{}'", t.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND task_type IN ({})", list));
        }

        sql.push_str(
            r#"
            ORDER BY CASE priority
                WHEN 'high' THEN 0
                WHEN 'medium' THEN 1
                ELSE 2
            END ASC, scheduled_time ASC
            "#,
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = sqlx::query(&sql).bind(now_ms).fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.row_to_task(row)).collect()
    }

    /// List tasks with optional filter.
    pub async fn recovery_list(&self, filter: TaskFilter) -> Result<Vec<RecoveryTask>> {
        let mut sql = String::from("SELECT * FROM pac_recovery_queue WHERE 1=1");

        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = '{}'", status.as_str()));
        }
        if let Some(task_type) = filter.task_type {
            sql.push_str(&format!(" AND task_type = '{}'", task_type.as_str()));
        }
        if filter.escalated_only {
            sql.push_str(" AND escalated = 1");
        }

        sql.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.row_to_task(row)).collect()
    }

    /// Get queue statistics.
    pub async fn recovery_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) as pending,
                SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END) as processing,
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) as completed,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) as failed,
                SUM(CASE WHEN status = 'exceeded_attempts' THEN 1 ELSE 0 END) as exceeded
            FROM pac_recovery_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0) as u64,
            processing: row.get::<Option<i64>, _>("processing").unwrap_or(0) as u64,
            completed: row.get::<Option<i64>, _>("completed").unwrap_or(0) as u64,
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0) as u64,
            exceeded_attempts: row.get::<Option<i64>, _>("exceeded").unwrap_or(0) as u64,
        })
    }

    fn row_to_task(&self, row: &sqlx::sqlite::SqliteRow) -> Result<RecoveryTask> {
        let type_str: String = row.get("task_type");
        let task_type = TaskType::parse(&type_str)
            .ok_or_else(|| RelayError::validation(format!("Unknown task type: {}", type_str)))?;

        let status_str: String = row.get("status");
        let status = TaskStatus::parse(&status_str).ok_or_else(|| {
            RelayError::validation(format!("Unknown task status: {}", status_str))
        })?;

        let priority_str: String = row.get("priority");
        let priority = TaskPriority::parse(&priority_str).ok_or_else(|| {
            RelayError::validation(format!("Unknown task priority: {}", priority_str))
        })?;

        let last_attempt: Option<i64> = row.get("last_attempt");
        let resolved_at: Option<i64> = row.get("resolved_at");

        Ok(RecoveryTask {
            id: row.get("id"),
            task_type,
            reference: DocumentRef {
                doctype: row.get("reference_doctype"),
                name: row.get("reference_name"),
            },
            interaction_id: row.get("interaction_id"),
            status,
            priority,
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            scheduled_time: Self::millis_to_datetime(row.get("scheduled_time")),
            last_attempt: last_attempt.map(Self::millis_to_datetime),
            last_error: row.get("last_error"),
            escalated: row.get::<i32, _>("escalated") != 0,
            assigned_to: row.get("assigned_to"),
            processing_notes: row.get("processing_notes"),
            created_by: row.get("created_by"),
            created_at: Self::millis_to_datetime(row.get("created_at")),
            resolved_at: resolved_at.map(Self::millis_to_datetime),
        })
    }
}

/// Translate the partial unique index violation into the duplicate-task
/// validation error.
fn map_active_task_violation(
    err: sqlx::Error,
    reference: &DocumentRef,
    task_type: TaskType,
) -> RelayError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint failed") => {
            RelayError::validation(format!(
                "An active {} task already exists for {}",
                task_type, reference
            ))
        }
        _ => RelayError::Sqlx(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_db() -> (TempDir, RelayDb) {
        let tmp = TempDir::new().unwrap();
        let db = RelayDb::open(tmp.path().join("recovery.db")).await.unwrap();
        (tmp, db)
    }

    fn task_row(name: &str, task_type: TaskType, priority: TaskPriority) -> NewTask {
        NewTask {
            task_type,
            reference: DocumentRef::new("Invoice", name),
            interaction_id: None,
            priority,
            max_attempts: 3,
            scheduled_time_ms: RelayDb::now_millis() - 1_000,
            created_by: "tester".to_string(),
            initial_note: "created\n".to_string(),
        }
    }

    #[tokio::test]
    async fn test_claim_is_atomic() {
        let (_tmp, db) = test_db().await;

        let id = db
            .recovery_insert(&task_row("INV-1", TaskType::TimeoutRecovery, TaskPriority::High))
            .await
            .unwrap();

        let now = RelayDb::now_millis();
        let first = db.recovery_claim(id, now).await.unwrap();
        let second = db.recovery_claim(id, now).await.unwrap();

        assert!(first);
        assert!(!second);

        let task = db.recovery_get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let (_tmp, db) = test_db().await;

        let id = db
            .recovery_insert(&task_row("INV-2", TaskType::TimeoutRecovery, TaskPriority::High))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.recovery_claim(id, RelayDb::now_millis()).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_dequeue_priority_then_schedule() {
        let (_tmp, db) = test_db().await;

        let base = RelayDb::now_millis() - 60_000;
        let mut low = task_row("INV-LOW", TaskType::SyncError, TaskPriority::Low);
        low.scheduled_time_ms = base;
        let mut high_late = task_row("INV-HI-2", TaskType::TimeoutRecovery, TaskPriority::High);
        high_late.scheduled_time_ms = base + 2_000;
        let mut high_early = task_row("INV-HI-1", TaskType::TimeoutRecovery, TaskPriority::High);
        high_early.scheduled_time_ms = base + 1_000;
        let mut future = task_row("INV-FUT", TaskType::SyncError, TaskPriority::High);
        future.scheduled_time_ms = RelayDb::now_millis() + 3_600_000;

        db.recovery_insert(&low).await.unwrap();
        db.recovery_insert(&high_late).await.unwrap();
        db.recovery_insert(&high_early).await.unwrap();
        db.recovery_insert(&future).await.unwrap();

        let eligible = db
            .recovery_dequeue_eligible(RelayDb::now_millis(), None, None)
            .await
            .unwrap();

        let names: Vec<&str> = eligible.iter().map(|t| t.reference.name.as_str()).collect();
        assert_eq!(names, vec!["INV-HI-1", "INV-HI-2", "INV-LOW"]);
    }

    #[tokio::test]
    async fn test_dequeue_type_filter() {
        let (_tmp, db) = test_db().await;

        db.recovery_insert(&task_row("INV-A", TaskType::TimeoutRecovery, TaskPriority::High))
            .await
            .unwrap();
        db.recovery_insert(&task_row("INV-B", TaskType::ManualFix, TaskPriority::High))
            .await
            .unwrap();

        let eligible = db
            .recovery_dequeue_eligible(
                RelayDb::now_millis(),
                Some(&[TaskType::TimeoutRecovery, TaskType::SyncError]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].task_type, TaskType::TimeoutRecovery);
    }

    #[tokio::test]
    async fn test_active_unique_index_backstop() {
        let (_tmp, db) = test_db().await;

        db.recovery_insert(&task_row("INV-3", TaskType::TimeoutRecovery, TaskPriority::High))
            .await
            .unwrap();
        let err = db
            .recovery_insert(&task_row("INV-3", TaskType::TimeoutRecovery, TaskPriority::High))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        // A different task type for the same reference is fine.
        db.recovery_insert(&task_row("INV-3", TaskType::SyncError, TaskPriority::Medium))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (_tmp, db) = test_db().await;

        let id = db
            .recovery_insert(&task_row("INV-4", TaskType::TimeoutRecovery, TaskPriority::High))
            .await
            .unwrap();
        db.recovery_insert(&task_row("INV-5", TaskType::SyncError, TaskPriority::Medium))
            .await
            .unwrap();

        db.recovery_claim(id, RelayDb::now_millis()).await.unwrap();
        db.recovery_mark_completed(id, "done\n", RelayDb::now_millis())
            .await
            .unwrap();

        let stats = db.recovery_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 0);
    }
}
