//! Database migrations.
//!
//! Uses SQLx embedded migrations for the SQLite store.

use sqlx::SqlitePool;

use crate::infra::Result;

static SQLITE_MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations/sqlite");

pub async fn run_sqlite(pool: &SqlitePool) -> Result<()> {
    SQLITE_MIGRATOR.run(pool).await?;
    Ok(())
}
