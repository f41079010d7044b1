//! End-to-end flows through the orchestrator with mock collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pacrelay_core::{
    DocumentDirectory, DocumentRef, InteractionOutcome, InteractionRecord, Orchestrator,
    PacClient, PacResponse, RecoveryTask, RelayDb, RequestType, TaskFilter, TaskPriority,
    TaskStatus, TaskType,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Scripted PAC: answers every call with a fixed response.
struct ScriptedPac {
    response: PacResponse,
    verify_result: Option<Value>,
    calls: AtomicUsize,
}

impl ScriptedPac {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            response: PacResponse::success(json!({"uuid": "A1B2"})),
            verify_result: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            response: PacResponse::failure(503, "pac unavailable"),
            verify_result: None,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PacClient for ScriptedPac {
    async fn call(&self, _request_type: RequestType, _payload: Option<&Value>) -> PacResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }

    async fn verify(&self, _reference: &DocumentRef) -> Option<Value> {
        self.verify_result.clone()
    }
}

/// Document directory that records every callback.
struct RecordingDirectory {
    existing: Mutex<HashSet<DocumentRef>>,
    completed: Mutex<Vec<i64>>,
    resolved: Mutex<Vec<i64>>,
}

impl RecordingDirectory {
    fn with_invoices(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            existing: Mutex::new(
                names
                    .iter()
                    .map(|n| DocumentRef::new("Invoice", *n))
                    .collect(),
            ),
            completed: Mutex::new(Vec::new()),
            resolved: Mutex::new(Vec::new()),
        })
    }

    fn completed_ids(&self) -> Vec<i64> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentDirectory for RecordingDirectory {
    async fn exists(&self, reference: &DocumentRef) -> bool {
        self.existing.lock().unwrap().contains(reference)
    }

    async fn on_interaction_complete(&self, record: &InteractionRecord) {
        self.completed.lock().unwrap().push(record.id);
    }

    async fn on_task_resolved(&self, task: &RecoveryTask) {
        self.resolved.lock().unwrap().push(task.id);
    }
}

async fn setup(
    pac: Arc<ScriptedPac>,
    invoices: &[&str],
) -> (TempDir, Orchestrator, Arc<RecordingDirectory>) {
    let tmp = TempDir::new().unwrap();
    let db = RelayDb::open(tmp.path().join("flow.db")).await.unwrap();
    let docs = RecordingDirectory::with_invoices(invoices);
    (tmp, Orchestrator::new(db, pac, docs.clone()), docs)
}

async fn all_tasks(orchestrator: &Orchestrator) -> Vec<RecoveryTask> {
    orchestrator
        .queue()
        .list(TaskFilter::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn stamp_success_creates_no_recovery_work() {
    let (_tmp, orchestrator, docs) = setup(ScriptedPac::ok(), &["INV-1"]).await;

    let record = orchestrator
        .submit(
            "invoicing",
            RequestType::Stamp,
            Some(DocumentRef::new("Invoice", "INV-1")),
            Some(json!({"total": 1250})),
        )
        .await
        .unwrap();

    assert!(!record.timeout_flag);
    assert_eq!(record.response_http_code, Some(200));
    assert_eq!(record.response_payload, Some(json!({"uuid": "A1B2"})));
    assert!(all_tasks(&orchestrator).await.is_empty());
    assert_eq!(docs.completed_ids(), vec![record.id]);
}

#[tokio::test]
async fn timeout_opens_one_high_priority_task() {
    let (_tmp, orchestrator, docs) = setup(ScriptedPac::ok(), &["INV-2"]).await;

    let record = orchestrator
        .begin_interaction(
            "invoicing",
            RequestType::Stamp,
            Some(DocumentRef::new("Invoice", "INV-2")),
            None,
        )
        .await
        .unwrap();

    let slow = record.request_timestamp + Duration::seconds(35);
    let completed = orchestrator
        .complete_interaction(
            record.id,
            InteractionOutcome::error(0, "read timed out").observed_at(slow),
        )
        .await
        .unwrap();

    assert!(completed.timeout_flag);
    assert_eq!(docs.completed_ids(), vec![record.id]);

    let tasks = all_tasks(&orchestrator).await;
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.task_type, TaskType::TimeoutRecovery);
    assert_eq!(task.priority, TaskPriority::High);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.interaction_id, Some(record.id));

    // First eligible roughly two minutes out.
    let delta = task.scheduled_time - Utc::now();
    assert!(delta > Duration::seconds(110) && delta < Duration::seconds(130));
}

#[tokio::test]
async fn transient_failure_opens_sync_error_task() {
    let (_tmp, orchestrator, _docs) = setup(ScriptedPac::down(), &["INV-3"]).await;

    let record = orchestrator
        .submit(
            "invoicing",
            RequestType::Stamp,
            Some(DocumentRef::new("Invoice", "INV-3")),
            Some(json!({"total": 10})),
        )
        .await
        .unwrap();

    assert_eq!(record.system_error.as_deref(), Some("pac unavailable"));

    let tasks = all_tasks(&orchestrator).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::SyncError);
    assert_eq!(tasks[0].priority, TaskPriority::Medium);
}

#[tokio::test]
async fn second_detector_does_not_duplicate_the_task() {
    let (_tmp, orchestrator, _docs) = setup(ScriptedPac::ok(), &["INV-4"]).await;

    for _ in 0..2 {
        let record = orchestrator
            .begin_interaction(
                "invoicing",
                RequestType::Stamp,
                Some(DocumentRef::new("Invoice", "INV-4")),
                None,
            )
            .await
            .unwrap();
        let slow = record.request_timestamp + Duration::seconds(40);
        orchestrator
            .complete_interaction(
                record.id,
                InteractionOutcome::error(0, "read timed out").observed_at(slow),
            )
            .await
            .unwrap();
    }

    // Two timed-out interactions, one live remediation task.
    assert_eq!(all_tasks(&orchestrator).await.len(), 1);
}

#[tokio::test]
async fn retry_records_never_open_recovery_tasks() {
    let (_tmp, orchestrator, _docs) = setup(ScriptedPac::ok(), &["INV-5"]).await;

    let original = orchestrator
        .begin_interaction(
            "invoicing",
            RequestType::Stamp,
            Some(DocumentRef::new("Invoice", "INV-5")),
            None,
        )
        .await
        .unwrap();
    let slow = original.request_timestamp + Duration::seconds(40);
    orchestrator
        .complete_interaction(
            original.id,
            InteractionOutcome::error(0, "read timed out").observed_at(slow),
        )
        .await
        .unwrap();
    assert_eq!(all_tasks(&orchestrator).await.len(), 1);

    // A retry that times out again must not spawn a second task.
    let original = orchestrator.ledger().get(original.id).await.unwrap();
    let retry = orchestrator
        .retry_interaction("worker-1", &original)
        .await
        .unwrap();
    let slow = retry.request_timestamp + Duration::seconds(40);
    orchestrator
        .complete_interaction(
            retry.id,
            InteractionOutcome::error(0, "read timed out").observed_at(slow),
        )
        .await
        .unwrap();

    assert_eq!(all_tasks(&orchestrator).await.len(), 1);
}

#[tokio::test]
async fn request_ids_stay_unique_under_concurrency() {
    let (_tmp, orchestrator, _docs) = setup(ScriptedPac::ok(), &[]).await;

    let mut handles = Vec::new();
    for _ in 0..1_000 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .begin_interaction("loadgen", RequestType::StatusQuery, None, None)
                .await
                .unwrap()
                .request_id
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.await.unwrap()));
    }
    assert_eq!(seen.len(), 1_000);
}
