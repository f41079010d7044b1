//! PAC Relay recovery worker.
//!
//! Polls the recovery queue, reconciles suspicious timeouts against the
//! PAC's status endpoint, and re-drives failed interactions through the
//! retry chain. Any number of workers may run against the same database;
//! task claiming is atomic in storage.

mod worker;

pub use worker::{RecoveryWorker, WorkerConfig};
