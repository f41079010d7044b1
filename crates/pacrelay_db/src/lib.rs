//! Unified storage layer for PAC Relay.
//!
//! This crate provides a single source of truth for all database
//! operations behind the interaction ledger and the recovery queue.
//! Every conditional (compare-and-swap) update lives here so atomicity is
//! enforced by SQL, not by in-process locks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pacrelay_db::{RelayDb, Result};
//!
//! let db = RelayDb::open("~/.pacrelay/pacrelay.sqlite3").await?;
//!
//! // Ledger operations
//! let record = db.ledger_get(42).await?;
//!
//! // Recovery queue operations
//! let eligible = db.recovery_dequeue_eligible(RelayDb::now_millis(), None, None).await?;
//! ```

mod error;
mod schema;
mod types;

// Method implementations organized by domain
mod ledger;
mod recovery;

pub use error::{RelayError, Result};
pub use types::*;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Unified database for all PAC Relay operations.
///
/// This is the ONLY way to access the database. Do not use raw sqlx elsewhere.
#[derive(Clone)]
pub struct RelayDb {
    pool: SqlitePool,
}

impl RelayDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };

        // Run migrations/schema creation
        db.ensure_schema().await?;

        info!(path = %path.display(), "Database opened");

        Ok(db)
    }

    /// Open an existing database (fails if not exists).
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RelayError::NotFound(format!(
                "Database not found: {}",
                path.display()
            )));
        }

        let url = format!("sqlite:{}?mode=rw", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl RelayDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}
