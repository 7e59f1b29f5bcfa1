//! SQLite implementations of the durable store
//!
//! One database holds the ledger, the job queue, the sync log, contact
//! mappings, list memberships and reconcile runs. Components share nothing
//! else; every cross-worker interaction goes through these tables.

mod jobs;
mod ledger;
mod mappings;
mod membership;
mod reconcile_runs;
mod sync_log;

pub use jobs::*;
pub use ledger::*;
pub use mappings::*;
pub use membership::*;
pub use reconcile_runs::*;
pub use sync_log::*;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::infra::{Result, SyncError};

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool plus the repositories built on it
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a WAL-mode database and run migrations
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Single-connection in-memory database for tests and local runs
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // The database lives as long as its only connection, so never recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Apply embedded migrations
    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_sqlite(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn ledger(&self) -> SqliteLedger {
        SqliteLedger::new(self.pool.clone())
    }

    pub fn jobs(&self) -> SqliteJobQueue {
        SqliteJobQueue::new(self.pool.clone())
    }

    pub fn sync_log(&self) -> SqliteSyncLog {
        SqliteSyncLog::new(self.pool.clone())
    }

    pub fn memberships(&self) -> SqliteMembershipStore {
        SqliteMembershipStore::new(self.pool.clone())
    }

    pub fn mappings(&self) -> SqliteMappingStore {
        SqliteMappingStore::new(self.pool.clone())
    }

    pub fn reconcile_runs(&self) -> SqliteReconcileRunStore {
        SqliteReconcileRunStore::new(self.pool.clone())
    }
}

/// Fixed-width RFC 3339 so lexical order matches chronological order
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("Invalid {field}: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s, field)).transpose()
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| SyncError::Internal(format!("Invalid {field}: {e}")))
}
