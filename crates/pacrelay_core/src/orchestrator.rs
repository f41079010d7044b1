//! Thin glue between the ledger, the queue, and the collaborators.
//!
//! The ordering here is the whole point: the ledger row commits before the
//! PAC is called, the outcome commits before any recovery task is opened,
//! and the task insert never runs inside the ledger write. No lock ever
//! spans both stores.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pacrelay_db::{
    DocumentRef, InteractionRecord, RecoveryTask, RelayDb, RequestType, Result, TaskPriority,
    TaskType,
};
use serde_json::Value;
use tracing::info;

use crate::contracts::{DocumentDirectory, PacClient};
use crate::ledger::{InteractionOutcome, Ledger};
use crate::recovery::{EnqueueRequest, RecoveryQueue};

/// Delay before a freshly opened recovery task first becomes eligible.
const RECOVERY_DELAY_MINUTES: i64 = 2;

/// Entry point for the document subsystem: every PAC exchange goes through
/// here so that ledger-first ordering cannot be skipped.
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Ledger,
    queue: RecoveryQueue,
    pac: Arc<dyn PacClient>,
    documents: Arc<dyn DocumentDirectory>,
}

impl Orchestrator {
    pub fn new(
        db: RelayDb,
        pac: Arc<dyn PacClient>,
        documents: Arc<dyn DocumentDirectory>,
    ) -> Self {
        Self {
            ledger: Ledger::new(db.clone()),
            queue: RecoveryQueue::new(db, documents.clone()),
            pac,
            documents,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn queue(&self) -> &RecoveryQueue {
        &self.queue
    }

    /// Open a ledger record for a call the caller will perform itself.
    pub async fn begin_interaction(
        &self,
        actor: &str,
        request_type: RequestType,
        reference: Option<DocumentRef>,
        payload: Option<Value>,
    ) -> Result<InteractionRecord> {
        self.ledger.begin(actor, request_type, reference, payload).await
    }

    /// Write the outcome of a call into its ledger record, open recovery
    /// work if the outcome demands it, and notify the document subsystem.
    pub async fn complete_interaction(
        &self,
        id: i64,
        outcome: InteractionOutcome,
    ) -> Result<InteractionRecord> {
        let record = self.ledger.complete(id, outcome).await?;

        // Retries are driven by an existing task; only first attempts open
        // new recovery work.
        if !record.is_retry() {
            if record.timeout_flag {
                self.open_recovery(&record, TaskType::TimeoutRecovery, TaskPriority::High)
                    .await?;
            } else if record.system_error.is_some() {
                self.open_recovery(&record, TaskType::SyncError, TaskPriority::Medium)
                    .await?;
            }
        }

        self.documents.on_interaction_complete(&record).await;
        Ok(record)
    }

    /// Continue a retry chain on behalf of a recovery worker.
    pub async fn retry_interaction(
        &self,
        actor: &str,
        original: &InteractionRecord,
    ) -> Result<InteractionRecord> {
        self.ledger.retry(actor, original).await
    }

    /// Full request path: ledger entry, PAC call, outcome, recovery, callback.
    pub async fn submit(
        &self,
        actor: &str,
        request_type: RequestType,
        reference: Option<DocumentRef>,
        payload: Option<Value>,
    ) -> Result<InteractionRecord> {
        let record = self
            .ledger
            .begin(actor, request_type, reference, payload)
            .await?;

        let response = self
            .pac
            .call(request_type, record.request_payload.as_ref())
            .await;

        self.complete_interaction(
            record.id,
            InteractionOutcome {
                response_payload: response.payload,
                http_code: response.http_code,
                system_error: response.error,
                response_timestamp: None,
            },
        )
        .await
    }

    /// Open recovery work for a completed record, unless another detector
    /// already has a live task for the same document.
    async fn open_recovery(
        &self,
        record: &InteractionRecord,
        task_type: TaskType,
        priority: TaskPriority,
    ) -> Result<Option<RecoveryTask>> {
        let Some(reference) = record.reference.clone() else {
            // Nothing to remediate against; the ledger row itself is the
            // only evidence and it is already durable.
            return Ok(None);
        };

        if self.queue.has_active(&reference, task_type).await? {
            info!(
                interaction_id = record.id,
                reference = %reference,
                "Recovery task already open, skipping"
            );
            return Ok(None);
        }

        let req = EnqueueRequest::new(
            task_type,
            reference,
            Utc::now() + Duration::minutes(RECOVERY_DELAY_MINUTES),
            record.created_by.as_str(),
        )
        .with_priority(priority)
        .with_interaction(record.id);

        self.queue.enqueue(req).await.map(Some)
    }
}
