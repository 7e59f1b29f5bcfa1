//! Domain models for the sync middleware
//!
//! Events and their ledger lifecycle, dispatch jobs, known inbound payload shapes,
//! list memberships, the propagation audit trail and reconciliation runs.

mod event;
mod job;
mod mapping;
mod membership;
mod payload;
mod reconcile;
mod sync_log;
mod types;

pub use event::*;
pub use job::*;
pub use mapping::*;
pub use membership::*;
pub use payload::*;
pub use reconcile::*;
pub use sync_log::*;
pub use types::*;
