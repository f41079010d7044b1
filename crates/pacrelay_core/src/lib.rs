//! PAC Relay domain core.
//!
//! The system of record for every exchange with the external certification
//! authority (PAC), and the bounded-retry machinery that guarantees no PAC
//! response is ever lost:
//!
//! - [`Ledger`] - append-only interaction log with idempotency and
//!   freeze-on-complete guarantees.
//! - [`RecoveryQueue`] - task store with an explicit state machine, bounded
//!   backoff, and escalation to a human once attempts run out.
//! - [`Orchestrator`] - thin glue that writes the ledger entry before the
//!   PAC call, records the outcome after, and opens recovery work when the
//!   outcome is a timeout or a transient failure.
//!
//! Collaborators plug in through two narrow traits: [`PacClient`] (the
//! network call) and [`DocumentDirectory`] (the business-record side).

pub mod backoff;
pub mod contracts;
pub mod ledger;
pub mod orchestrator;
pub mod recovery;

pub use contracts::{DocumentDirectory, PacClient, PacResponse};
pub use ledger::{InteractionOutcome, Ledger, MAX_RETRY_CHAIN, PAC_TIMEOUT_MS};
pub use orchestrator::Orchestrator;
pub use recovery::{EnqueueRequest, RecoveryQueue, TaskStatusSummary};

// The storage layer's types are the domain vocabulary; re-export them so
// embedders depend on one crate.
pub use pacrelay_db::{
    AuditEntry, DocumentRef, InteractionRecord, QueueStats, RecoveryTask, RelayDb, RelayError,
    RequestType, Result, TaskFilter, TaskPriority, TaskStatus, TaskType,
};
