//! The recovery worker loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pacrelay_core::{
    DocumentDirectory, InteractionOutcome, Ledger, PacClient, RecoveryQueue, RecoveryTask,
    RelayDb, RelayError, RequestType, Result, TaskType,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded on every ledger row this worker creates.
    pub worker_id: String,
    /// How often to poll the queue when idle.
    pub poll_interval: Duration,
    /// Task types this worker claims. Manual types are left for operators.
    pub handled_types: Vec<TaskType>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "recovery-worker".to_string(),
            poll_interval: Duration::from_secs(5),
            handled_types: vec![TaskType::TimeoutRecovery, TaskType::SyncError],
        }
    }
}

/// Background worker that drains the recovery queue.
pub struct RecoveryWorker {
    config: WorkerConfig,
    ledger: Ledger,
    queue: RecoveryQueue,
    pac: Arc<dyn PacClient>,
    documents: Arc<dyn DocumentDirectory>,
    shutdown: watch::Receiver<bool>,
}

impl RecoveryWorker {
    /// Build a worker plus the handle used to stop it.
    pub fn new(
        db: RelayDb,
        pac: Arc<dyn PacClient>,
        documents: Arc<dyn DocumentDirectory>,
        config: WorkerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let worker = Self {
            config,
            ledger: Ledger::new(db.clone()),
            queue: RecoveryQueue::new(db, documents.clone()),
            pac,
            documents,
            shutdown: rx,
        };
        (worker, tx)
    }

    /// Poll until shutdown. A task claimed mid-flight finishes its attempt
    /// before the loop exits.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            poll_secs = self.config.poll_interval.as_secs(),
            "Recovery worker started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        error!(error = %e, "Recovery pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Recovery worker stopped");
        Ok(())
    }

    /// Claim and process everything currently eligible. Returns the number
    /// of tasks handled.
    pub async fn drain_once(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(task) = self
            .queue
            .claim_next_eligible(Utc::now(), Some(&self.config.handled_types))
            .await?
        {
            self.process(task).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Run one claimed task to an outcome.
    async fn process(&self, task: RecoveryTask) -> Result<()> {
        info!(
            task_id = task.id,
            task_type = %task.task_type,
            reference = %task.reference,
            attempt = task.attempts + 1,
            "Processing recovery task"
        );

        // Reconcile first: the timeout may have been spurious and the PAC
        // may already hold a response. Retrying blindly could double-stamp.
        if let Some(recovered) = self.pac.verify(&task.reference).await {
            return self.resolve_reconciled(&task, recovered).await;
        }

        let Some(interaction_id) = task.interaction_id else {
            self.queue
                .fail(task.id, "task has no interaction reference", None, false)
                .await?;
            return Ok(());
        };

        let original = match self.ledger.get(interaction_id).await {
            Ok(record) => record,
            Err(RelayError::NotFound(msg)) => {
                self.queue.fail(task.id, &msg, None, false).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Continue from the newest record in the chain, not the root, so
        // each attempt advances the bounded retry count.
        let tip = self
            .ledger
            .db()
            .ledger_retries_of(original.id)
            .await?
            .into_iter()
            .last()
            .unwrap_or(original);

        match self.ledger.retry(&self.config.worker_id, &tip).await {
            Ok(retry) => self.drive_retry(&task, retry.id).await,
            // An exhausted retry chain still counts as a spent attempt, so
            // the task escalates instead of spinning forever.
            Err(RelayError::Validation(msg)) => {
                self.queue.fail(task.id, &msg, None, true).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Push one retry record through the PAC and settle the task.
    async fn drive_retry(&self, task: &RecoveryTask, retry_id: i64) -> Result<()> {
        let retry = self.ledger.get(retry_id).await?;
        let response = self
            .pac
            .call(retry.request_type, retry.request_payload.as_ref())
            .await;

        let completed = self
            .ledger
            .complete(
                retry.id,
                InteractionOutcome {
                    response_payload: response.payload.clone(),
                    http_code: response.http_code,
                    system_error: response.error.clone(),
                    response_timestamp: None,
                },
            )
            .await?;
        self.documents.on_interaction_complete(&completed).await;

        if response.is_success() && !completed.timeout_flag {
            self.queue
                .succeed(
                    task.id,
                    Some(&format!("recovered on retry {}", completed.retry_count)),
                )
                .await?;
        } else {
            let message = completed
                .system_error
                .clone()
                .unwrap_or_else(|| format!("http {}", response.http_code));
            self.queue.fail(task.id, &message, None, true).await?;
        }
        Ok(())
    }

    /// The PAC already processed the lost request: record the recovered
    /// response as a completed status query and close the task.
    async fn resolve_reconciled(&self, task: &RecoveryTask, recovered: Value) -> Result<()> {
        let probe = self
            .ledger
            .begin(
                &self.config.worker_id,
                RequestType::StatusQuery,
                Some(task.reference.clone()),
                None,
            )
            .await?;
        let completed = self
            .ledger
            .complete(probe.id, InteractionOutcome::success(recovered))
            .await?;
        self.documents.on_interaction_complete(&completed).await;

        info!(
            task_id = task.id,
            interaction_id = completed.id,
            "PAC already processed the original request, reconciled"
        );
        self.queue
            .succeed(
                task.id,
                Some("reconciled: PAC already processed the original request"),
            )
            .await?;
        Ok(())
    }
}
