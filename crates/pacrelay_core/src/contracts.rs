//! Collaborator contracts.
//!
//! The relay core never reaches into business records and never performs
//! network IO itself. Everything it needs from the outside world comes
//! through these two traits.

use async_trait::async_trait;
use pacrelay_db::{DocumentRef, InteractionRecord, RecoveryTask, RequestType};
use serde_json::Value;

/// Structured result of a PAC call.
///
/// Implementations apply their own network-level timeout and surface every
/// failure as data; nothing panics across this seam.
#[derive(Debug, Clone)]
pub struct PacResponse {
    pub payload: Option<Value>,
    pub http_code: i32,
    pub error: Option<String>,
}

impl PacResponse {
    pub fn success(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            http_code: 200,
            error: None,
        }
    }

    pub fn failure(http_code: i32, error: impl Into<String>) -> Self {
        Self {
            payload: None,
            http_code,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_code) && self.error.is_none()
    }
}

/// The external certification authority, seen purely as an unreliable
/// network peer.
#[async_trait]
pub trait PacClient: Send + Sync {
    /// Perform the network call for a request.
    async fn call(&self, request_type: RequestType, payload: Option<&Value>) -> PacResponse;

    /// Reconciliation probe against the PAC's own status endpoint: if the
    /// PAC already processed a request for this document whose response was
    /// lost, return the recorded response payload.
    async fn verify(&self, reference: &DocumentRef) -> Option<Value>;
}

/// The document subsystem that originates requests and reacts to outcomes.
///
/// Deliberately narrow: existence checks plus two notification callbacks.
/// The relay core never reads business-record fields.
#[async_trait]
pub trait DocumentDirectory: Send + Sync {
    /// Does the referenced business record exist?
    async fn exists(&self, reference: &DocumentRef) -> bool;

    /// Fired exactly once when an interaction is completed.
    async fn on_interaction_complete(&self, record: &InteractionRecord);

    /// Fired when a recovery task reaches a terminal state.
    async fn on_task_resolved(&self, task: &RecoveryTask);
}
