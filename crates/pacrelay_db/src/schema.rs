//! Database schema creation for all PAC Relay tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::RelayDb;
use tracing::info;

impl RelayDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // WAL for concurrent readers, FULL sync: a ledger row must survive a
        // crash one instruction after the INSERT returns.
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=FULL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        self.create_ledger_tables().await?;
        self.create_recovery_tables().await?;

        info!("Database schema verified");
        Ok(())
    }

    /// Create interaction ledger tables.
    async fn create_ledger_tables(&self) -> Result<()> {
        // Interaction log: one row per request/response attempt
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pac_interaction_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL UNIQUE,
                request_type TEXT NOT NULL,
                reference_doctype TEXT,
                reference_name TEXT,
                request_timestamp INTEGER NOT NULL,
                response_timestamp INTEGER,
                request_payload TEXT,
                response_payload TEXT,
                response_http_code INTEGER,
                system_error TEXT,
                response_time_ms INTEGER,
                timeout_flag INTEGER NOT NULL DEFAULT 0,
                retry_of INTEGER REFERENCES pac_interaction_log(id),
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Privileged override audit trail, append-only
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pac_interaction_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                interaction_id INTEGER NOT NULL REFERENCES pac_interaction_log(id),
                operator TEXT NOT NULL,
                action TEXT NOT NULL,
                detail TEXT,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Ledger indexes
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_interaction_reference ON pac_interaction_log(reference_doctype, reference_name)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_interaction_timeout ON pac_interaction_log(timeout_flag)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_interaction_retry_of ON pac_interaction_log(retry_of)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_interaction ON pac_interaction_audit(interaction_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create recovery queue tables.
    async fn create_recovery_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pac_recovery_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL,
                reference_doctype TEXT NOT NULL,
                reference_name TEXT NOT NULL,
                interaction_id INTEGER REFERENCES pac_interaction_log(id),
                status TEXT NOT NULL DEFAULT 'pending',
                priority TEXT NOT NULL DEFAULT 'medium',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                scheduled_time INTEGER NOT NULL,
                last_attempt INTEGER,
                last_error TEXT,
                escalated INTEGER NOT NULL DEFAULT 0,
                assigned_to TEXT,
                processing_notes TEXT NOT NULL DEFAULT '',
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // At most one live task per (reference, task_type). The domain layer
        // checks first so callers get a ValidationError; this index is the
        // storage-level backstop for concurrent enqueues.
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_recovery_active
               ON pac_recovery_queue(reference_doctype, reference_name, task_type)
               WHERE status IN ('pending', 'processing')"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_recovery_status ON pac_recovery_queue(status, scheduled_time)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_recovery_reference ON pac_recovery_queue(reference_doctype, reference_name)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
