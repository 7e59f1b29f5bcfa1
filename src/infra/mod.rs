//! Infrastructure layer for the sync middleware
//!
//! Contains trait definitions and implementations for:
//! - Event ledger (SQLite)
//! - Durable job queue (SQLite)
//! - Sync log, contact mappings, list memberships, reconcile runs
//! - Retry policy with backoff

mod error;
mod retry;
pub mod sqlite;
mod traits;

pub use error::*;
pub use retry::{is_retryable_db_error, retry_db, RetryPolicy};
pub use sqlite::{
    SqliteJobQueue, SqliteLedger, SqliteMappingStore, SqliteMembershipStore,
    SqliteReconcileRunStore, SqliteSyncLog, Store,
};
pub use traits::*;
