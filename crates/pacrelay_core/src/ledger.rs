//! The interaction ledger: system of record for every PAC exchange.
//!
//! Write-then-act: a record is persisted durably *before* the network call
//! it describes is made, so a crash one instruction later still leaves
//! evidence. Once the response fields are set the record is frozen; the only
//! way past the freeze is the audited operator override.

use chrono::{DateTime, Utc};
use pacrelay_db::{
    DocumentRef, InteractionRecord, NewInteraction, RelayDb, RelayError, RequestType, Result,
};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

/// A response slower than this is a timeout, whatever its HTTP code says.
pub const PAC_TIMEOUT_MS: i64 = 30_000;

/// Longest allowed retry chain behind one original record.
pub const MAX_RETRY_CHAIN: i32 = 3;

/// Role allowed to amend a frozen record.
const OVERRIDE_ROLE: &str = "recovery-admin";

/// Outcome of a PAC call, as written into the ledger by `complete`.
#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub response_payload: Option<Value>,
    pub http_code: i32,
    pub system_error: Option<String>,
    /// When the response was observed. Defaults to now.
    pub response_timestamp: Option<DateTime<Utc>>,
}

impl InteractionOutcome {
    pub fn success(payload: Value) -> Self {
        Self {
            response_payload: Some(payload),
            http_code: 200,
            system_error: None,
            response_timestamp: None,
        }
    }

    pub fn error(http_code: i32, message: impl Into<String>) -> Self {
        Self {
            response_payload: None,
            http_code,
            system_error: Some(message.into()),
            response_timestamp: None,
        }
    }

    pub fn observed_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.response_timestamp = Some(timestamp);
        self
    }
}

/// Append-only ledger of PAC interactions.
#[derive(Clone)]
pub struct Ledger {
    db: RelayDb,
}

impl Ledger {
    pub fn new(db: RelayDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &RelayDb {
        &self.db
    }

    /// Open a new interaction record, durably, before any call is made.
    ///
    /// `actor` is the explicit caller identity recorded as `created_by`.
    pub async fn begin(
        &self,
        actor: &str,
        request_type: RequestType,
        reference: Option<DocumentRef>,
        payload: Option<Value>,
    ) -> Result<InteractionRecord> {
        if request_type.requires_reference() && reference.is_none() {
            return Err(RelayError::validation(format!(
                "request type '{}' requires a document reference",
                request_type
            )));
        }
        if let Some(ref p) = payload {
            validate_payload(p)?;
        }

        let request_id = Uuid::new_v4().to_string();
        // A v4 collision is practically impossible, but an idempotency key
        // that is not checked is not an idempotency key.
        if self.db.ledger_request_id_exists(&request_id).await? {
            return Err(RelayError::validation(format!(
                "request_id collision: {}",
                request_id
            )));
        }

        let new = NewInteraction {
            request_id,
            request_type,
            reference,
            request_timestamp_ms: RelayDb::now_millis(),
            request_payload: payload_to_string(payload.as_ref())?,
            retry_of: None,
            retry_count: 0,
            created_by: actor.to_string(),
        };

        let id = self.db.ledger_insert(&new).await?;
        let record = self.get(id).await?;
        info!(
            interaction_id = id,
            request_id = %record.request_id,
            request_type = %request_type,
            "Interaction opened"
        );
        Ok(record)
    }

    /// Freeze a record with the outcome of its PAC call.
    ///
    /// The only allowed mutation after creation. Computes the response delta
    /// once, raises the timeout flag past [`PAC_TIMEOUT_MS`], and persists
    /// durably before returning.
    pub async fn complete(
        &self,
        id: i64,
        outcome: InteractionOutcome,
    ) -> Result<InteractionRecord> {
        let record = self.get(id).await?;
        if record.is_completed() {
            return Err(RelayError::permission(format!(
                "interaction {} is already completed and immutable",
                id
            )));
        }

        if let Some(ref p) = outcome.response_payload {
            validate_payload(p)?;
        }

        let response_timestamp = outcome.response_timestamp.unwrap_or_else(Utc::now);
        let delta_ms = response_timestamp
            .timestamp_millis()
            .saturating_sub(record.request_timestamp.timestamp_millis());
        if delta_ms < 0 {
            return Err(RelayError::validation(format!(
                "response timestamp precedes request timestamp by {}ms",
                -delta_ms
            )));
        }

        let timeout_flag = delta_ms > PAC_TIMEOUT_MS;

        let updated = self
            .db
            .ledger_complete(
                id,
                response_timestamp.timestamp_millis(),
                payload_to_string(outcome.response_payload.as_ref())?.as_deref(),
                outcome.http_code,
                outcome.system_error.as_deref(),
                delta_ms,
                timeout_flag,
            )
            .await?;

        // Lost the freeze race: someone else completed it first.
        if !updated {
            return Err(RelayError::permission(format!(
                "interaction {} is already completed and immutable",
                id
            )));
        }

        if timeout_flag {
            warn!(
                interaction_id = id,
                response_time_ms = delta_ms,
                "Interaction exceeded response deadline"
            );
        } else {
            info!(
                interaction_id = id,
                http_code = outcome.http_code,
                response_time_ms = delta_ms,
                "Interaction completed"
            );
        }

        self.get(id).await
    }

    /// Open a fresh record continuing a retry chain.
    ///
    /// A retry is a *new* record; the prior one stays frozen. All retries
    /// reference the chain's root record, so the full history of a logical
    /// request hangs off one id. The chain is bounded at [`MAX_RETRY_CHAIN`].
    pub async fn retry(
        &self,
        actor: &str,
        prior: &InteractionRecord,
    ) -> Result<InteractionRecord> {
        let retry_count = prior.retry_count + 1;
        if retry_count > MAX_RETRY_CHAIN {
            return Err(RelayError::validation(format!(
                "retry chain for interaction {} is exhausted ({} of {} used)",
                prior.id, prior.retry_count, MAX_RETRY_CHAIN
            )));
        }

        let new = NewInteraction {
            request_id: Uuid::new_v4().to_string(),
            request_type: prior.request_type,
            reference: prior.reference.clone(),
            request_timestamp_ms: RelayDb::now_millis(),
            request_payload: payload_to_string(prior.request_payload.as_ref())?,
            retry_of: Some(prior.retry_of.unwrap_or(prior.id)),
            retry_count,
            created_by: actor.to_string(),
        };

        let id = self.db.ledger_insert(&new).await?;
        info!(
            interaction_id = id,
            retry_of = new.retry_of,
            retry_count,
            "Retry interaction opened"
        );
        self.get(id).await
    }

    /// Get a record, failing with NotFound if absent.
    pub async fn get(&self, id: i64) -> Result<InteractionRecord> {
        self.db
            .ledger_get(id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("interaction {}", id)))
    }

    pub async fn get_by_request_id(&self, request_id: &str) -> Result<InteractionRecord> {
        self.db
            .ledger_get_by_request_id(request_id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("interaction request_id {}", request_id)))
    }

    /// Audited operator override: amend outcome fields on a frozen record.
    ///
    /// Requires the `recovery-admin` role. Cannot delete a record; every use
    /// lands in the audit trail.
    #[allow(clippy::too_many_arguments)]
    pub async fn override_outcome(
        &self,
        role: &str,
        operator: &str,
        id: i64,
        reason: &str,
        response_payload: Option<Value>,
        http_code: Option<i32>,
        system_error: Option<String>,
    ) -> Result<InteractionRecord> {
        if role != OVERRIDE_ROLE {
            return Err(RelayError::permission(format!(
                "role '{}' may not override ledger records",
                role
            )));
        }
        if let Some(ref p) = response_payload {
            validate_payload(p)?;
        }

        // Ensure the record exists before touching anything.
        self.get(id).await?;

        self.db
            .ledger_force_outcome(
                id,
                payload_to_string(response_payload.as_ref())?.as_deref(),
                http_code,
                system_error.as_deref(),
            )
            .await?;
        self.db
            .ledger_append_audit(id, operator, "override_outcome", Some(reason))
            .await?;

        warn!(interaction_id = id, operator, "Ledger record overridden");
        self.get(id).await
    }
}

/// Payloads are opaque to the relay but must be well-formed JSON objects.
fn validate_payload(payload: &Value) -> Result<()> {
    if !payload.is_object() {
        return Err(RelayError::validation(
            "payload must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

fn payload_to_string(payload: Option<&Value>) -> Result<Option<String>> {
    payload
        .map(|p| serde_json::to_string(p).map_err(RelayError::from))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_ledger() -> (TempDir, Ledger) {
        let tmp = TempDir::new().unwrap();
        let db = RelayDb::open(tmp.path().join("core.db")).await.unwrap();
        (tmp, Ledger::new(db))
    }

    fn invoice_ref() -> DocumentRef {
        DocumentRef::new("Invoice", "INV-1")
    }

    #[tokio::test]
    async fn test_begin_requires_reference_for_stamp() {
        let (_tmp, ledger) = test_ledger().await;

        let err = ledger
            .begin("tester", RequestType::Stamp, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        // A status query without a reference is fine.
        ledger
            .begin("tester", RequestType::StatusQuery, None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_begin_rejects_non_object_payload() {
        let (_tmp, ledger) = test_ledger().await;

        let err = ledger
            .begin(
                "tester",
                RequestType::Stamp,
                Some(invoice_ref()),
                Some(json!(["not", "an", "object"])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_complete_computes_exact_delta() {
        let (_tmp, ledger) = test_ledger().await;

        let record = ledger
            .begin("tester", RequestType::Stamp, Some(invoice_ref()), None)
            .await
            .unwrap();

        let response_at = record.request_timestamp + Duration::milliseconds(2_000);
        let completed = ledger
            .complete(
                record.id,
                InteractionOutcome::success(json!({"uuid": "X"})).observed_at(response_at),
            )
            .await
            .unwrap();

        assert_eq!(completed.response_time_ms, Some(2_000));
        assert!(!completed.timeout_flag);
        assert!(completed.response_timestamp.unwrap() >= completed.request_timestamp);
    }

    #[tokio::test]
    async fn test_complete_rejects_time_travel() {
        let (_tmp, ledger) = test_ledger().await;

        let record = ledger
            .begin("tester", RequestType::Stamp, Some(invoice_ref()), None)
            .await
            .unwrap();

        let before_request = record.request_timestamp - Duration::seconds(5);
        let err = ledger
            .complete(
                record.id,
                InteractionOutcome::success(json!({})).observed_at(before_request),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_timeout_flag_past_threshold() {
        let (_tmp, ledger) = test_ledger().await;

        let record = ledger
            .begin("tester", RequestType::Stamp, Some(invoice_ref()), None)
            .await
            .unwrap();
        let slow = record.request_timestamp + Duration::seconds(35);
        let completed = ledger
            .complete(
                record.id,
                InteractionOutcome::error(0, "socket timeout").observed_at(slow),
            )
            .await
            .unwrap();
        assert!(completed.timeout_flag);

        let record = ledger
            .begin("tester", RequestType::Stamp, Some(DocumentRef::new("Invoice", "INV-2")), None)
            .await
            .unwrap();
        let fast = record.request_timestamp + Duration::seconds(2);
        let completed = ledger
            .complete(
                record.id,
                InteractionOutcome::success(json!({"uuid": "Y"})).observed_at(fast),
            )
            .await
            .unwrap();
        assert!(!completed.timeout_flag);
    }

    #[tokio::test]
    async fn test_completed_record_is_immutable() {
        let (_tmp, ledger) = test_ledger().await;

        let record = ledger
            .begin("tester", RequestType::Stamp, Some(invoice_ref()), None)
            .await
            .unwrap();
        ledger
            .complete(record.id, InteractionOutcome::success(json!({"uuid": "X"})))
            .await
            .unwrap();

        let err = ledger
            .complete(record.id, InteractionOutcome::success(json!({"uuid": "Z"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Permission(_)));
    }

    #[tokio::test]
    async fn test_retry_chain_bounded_at_three() {
        let (_tmp, ledger) = test_ledger().await;

        let original = ledger
            .begin("tester", RequestType::Stamp, Some(invoice_ref()), None)
            .await
            .unwrap();

        let r1 = ledger.retry("worker", &original).await.unwrap();
        assert_eq!(r1.retry_count, 1);
        assert_eq!(r1.retry_of, Some(original.id));
        assert_ne!(r1.request_id, original.request_id);

        let r2 = ledger.retry("worker", &r1).await.unwrap();
        let r3 = ledger.retry("worker", &r2).await.unwrap();
        assert_eq!(r3.retry_count, 3);

        // The 4th retry would carry retry_count = 4.
        let err = ledger.retry("worker", &r3).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_override_requires_role_and_audits() {
        let (_tmp, ledger) = test_ledger().await;

        let record = ledger
            .begin("tester", RequestType::Stamp, Some(invoice_ref()), None)
            .await
            .unwrap();
        ledger
            .complete(record.id, InteractionOutcome::error(500, "pac rejected"))
            .await
            .unwrap();

        let err = ledger
            .override_outcome(
                "accounts-clerk",
                "mallory",
                record.id,
                "no reason",
                None,
                Some(200),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Permission(_)));

        let fixed = ledger
            .override_outcome(
                "recovery-admin",
                "alice",
                record.id,
                "PAC confirmed stamp out of band",
                Some(json!({"uuid": "X"})),
                Some(200),
                None,
            )
            .await
            .unwrap();
        assert_eq!(fixed.response_http_code, Some(200));

        let trail = ledger.db().ledger_audit_trail(record.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].operator, "alice");
    }

    #[tokio::test]
    async fn test_begin_generates_unique_request_ids_concurrently() {
        let (_tmp, ledger) = test_ledger().await;

        let mut handles = Vec::new();
        for i in 0..100 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .begin(
                        "tester",
                        RequestType::Stamp,
                        Some(DocumentRef::new("Invoice", format!("INV-{}", i))),
                        None,
                    )
                    .await
                    .unwrap()
                    .request_id
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 100);
    }
}
