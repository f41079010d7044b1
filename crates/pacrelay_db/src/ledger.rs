//! Interaction ledger storage operations.
//!
//! The ledger is append-only: rows are inserted by `ledger_insert`, frozen
//! by the single conditional update in `ledger_complete`, and never deleted.
//! Everything else is a read or an audit append.

use crate::error::{RelayError, Result};
use crate::types::*;
use crate::RelayDb;
use sqlx::Row;

impl RelayDb {
    // ========================================================================
    // Interaction Log Operations
    // ========================================================================

    /// Insert a new interaction row. The write is durable when this returns.
    pub async fn ledger_insert(&self, new: &NewInteraction) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO pac_interaction_log
                (request_id, request_type, reference_doctype, reference_name,
                 request_timestamp, request_payload, retry_of, retry_count, created_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.request_id)
        .bind(new.request_type.as_str())
        .bind(new.reference.as_ref().map(|r| r.doctype.as_str()))
        .bind(new.reference.as_ref().map(|r| r.name.as_str()))
        .bind(new.request_timestamp_ms)
        .bind(new.request_payload.as_deref())
        .bind(new.retry_of)
        .bind(new.retry_count)
        .bind(&new.created_by)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, "request_id collision"))?;

        Ok(result.last_insert_rowid())
    }

    /// Get an interaction by ID.
    pub async fn ledger_get(&self, id: i64) -> Result<Option<InteractionRecord>> {
        let row = sqlx::query("SELECT * FROM pac_interaction_log WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_interaction(&row)?)),
            None => Ok(None),
        }
    }

    /// Get an interaction by its idempotency key.
    pub async fn ledger_get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<InteractionRecord>> {
        let row = sqlx::query("SELECT * FROM pac_interaction_log WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_interaction(&row)?)),
            None => Ok(None),
        }
    }

    /// Check whether a request id is already taken.
    pub async fn ledger_request_id_exists(&self, request_id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pac_interaction_log WHERE request_id = ?")
                .bind(request_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Freeze an interaction with its response fields.
    ///
    /// Guarded by `response_timestamp IS NULL`: the first completion wins and
    /// every later attempt reports `false`. This is the only mutation the
    /// ledger allows outside the privileged override path.
    #[allow(clippy::too_many_arguments)]
    pub async fn ledger_complete(
        &self,
        id: i64,
        response_timestamp_ms: i64,
        response_payload: Option<&str>,
        response_http_code: i32,
        system_error: Option<&str>,
        response_time_ms: i64,
        timeout_flag: bool,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE pac_interaction_log SET
                response_timestamp = ?,
                response_payload = ?,
                response_http_code = ?,
                system_error = ?,
                response_time_ms = ?,
                timeout_flag = ?
            WHERE id = ? AND response_timestamp IS NULL
            "#,
        )
        .bind(response_timestamp_ms)
        .bind(response_payload)
        .bind(response_http_code)
        .bind(system_error)
        .bind(response_time_ms)
        .bind(timeout_flag as i32)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Privileged override: amend outcome fields on a frozen record.
    ///
    /// No freeze guard on purpose; the caller (domain layer) enforces the
    /// operator role and writes the audit entry in the same call.
    pub async fn ledger_force_outcome(
        &self,
        id: i64,
        response_payload: Option<&str>,
        response_http_code: Option<i32>,
        system_error: Option<&str>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE pac_interaction_log SET
                response_payload = COALESCE(?, response_payload),
                response_http_code = COALESCE(?, response_http_code),
                system_error = COALESCE(?, system_error)
            WHERE id = ?
            "#,
        )
        .bind(response_payload)
        .bind(response_http_code)
        .bind(system_error)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// List the retry chain hanging off an original record.
    pub async fn ledger_retries_of(&self, id: i64) -> Result<Vec<InteractionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM pac_interaction_log WHERE retry_of = ? ORDER BY retry_count ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.row_to_interaction(row)).collect()
    }

    // ========================================================================
    // Audit Trail Operations
    // ========================================================================

    /// Append a privileged-override audit entry.
    pub async fn ledger_append_audit(
        &self,
        interaction_id: i64,
        operator: &str,
        action: &str,
        detail: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO pac_interaction_audit (interaction_id, operator, action, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(interaction_id)
        .bind(operator)
        .bind(action)
        .bind(detail)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Read the audit trail for an interaction, oldest first.
    pub async fn ledger_audit_trail(&self, interaction_id: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM pac_interaction_audit WHERE interaction_id = ? ORDER BY id ASC",
        )
        .bind(interaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AuditEntry {
                    id: row.get("id"),
                    interaction_id: row.get("interaction_id"),
                    operator: row.get("operator"),
                    action: row.get("action"),
                    detail: row.get("detail"),
                    created_at: Self::millis_to_datetime(row.get("created_at")),
                })
            })
            .collect()
    }

    fn row_to_interaction(&self, row: &sqlx::sqlite::SqliteRow) -> Result<InteractionRecord> {
        let type_str: String = row.get("request_type");
        let request_type = RequestType::parse(&type_str).ok_or_else(|| {
            RelayError::validation(format!("Unknown request type: {}", type_str))
        })?;

        let doctype: Option<String> = row.get("reference_doctype");
        let name: Option<String> = row.get("reference_name");
        let reference = match (doctype, name) {
            (Some(doctype), Some(name)) => Some(DocumentRef { doctype, name }),
            _ => None,
        };

        let request_payload: Option<String> = row.get("request_payload");
        let response_payload: Option<String> = row.get("response_payload");
        let response_timestamp: Option<i64> = row.get("response_timestamp");

        Ok(InteractionRecord {
            id: row.get("id"),
            request_id: row.get("request_id"),
            request_type,
            reference,
            request_timestamp: Self::millis_to_datetime(row.get("request_timestamp")),
            response_timestamp: response_timestamp.map(Self::millis_to_datetime),
            request_payload: request_payload
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            response_payload: response_payload
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            response_http_code: row.get("response_http_code"),
            system_error: row.get("system_error"),
            response_time_ms: row.get("response_time_ms"),
            timeout_flag: row.get::<i32, _>("timeout_flag") != 0,
            retry_of: row.get("retry_of"),
            retry_count: row.get("retry_count"),
            created_by: row.get("created_by"),
        })
    }
}

/// Translate a SQLite UNIQUE violation into a validation error.
fn map_unique_violation(err: sqlx::Error, context: &str) -> RelayError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint failed") => {
            RelayError::validation(format!("{}: {}", context, db_err.message()))
        }
        _ => RelayError::Sqlx(err),
    }
}
