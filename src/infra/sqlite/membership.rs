//! Contact list membership storage
//!
//! Rows are unique per (contact, agent, list) and flip between `active`
//! and `removed`; they are never deleted, so history survives reassignment.

use std::collections::BTreeSet;

use chrono::Utc;
use sqlx::{sqlite::SqlitePool, FromRow};
use tracing::debug;

use super::{parse_ts, ts};
use crate::domain::{ContactListMembership, MembershipChange, MembershipDelta};
use crate::infra::{Result, SyncError};

#[derive(Clone)]
pub struct SqliteMembershipStore {
    pool: SqlitePool,
}

impl SqliteMembershipStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply adds and removes for one (contact, agent) in a single transaction.
    ///
    /// Already-active adds and already-removed removes are no-ops, so replaying
    /// the same change yields an empty delta.
    pub async fn apply(&self, change: &MembershipChange) -> Result<MembershipDelta> {
        if let Some(key) = change
            .add_list_keys
            .intersection(&change.remove_list_keys)
            .next()
        {
            return Err(SyncError::InvalidInput(format!(
                "list {key} is both added and removed"
            )));
        }
        if change.is_empty() {
            return Ok(MembershipDelta::default());
        }

        let now = ts(Utc::now());
        let mut delta = MembershipDelta::default();
        let mut tx = self.pool.begin().await?;

        for list_key in &change.remove_list_keys {
            let result = sqlx::query(
                r#"
                UPDATE contact_list_memberships
                SET status = 'removed', correlation_id = ?, updated_at = ?
                WHERE contact_id = ? AND agent_key = ? AND list_key = ? AND status = 'active'
                "#,
            )
            .bind(change.correlation_id.as_str())
            .bind(&now)
            .bind(&change.contact_id)
            .bind(&change.agent_key)
            .bind(list_key)
            .execute(&mut *tx)
            .await?;
            delta.removed += result.rows_affected() as u32;
        }

        for list_key in &change.add_list_keys {
            let result = sqlx::query(
                r#"
                INSERT INTO contact_list_memberships (
                    contact_id, agent_key, list_key, status, correlation_id, created_at, updated_at
                ) VALUES (?, ?, ?, 'active', ?, ?, ?)
                ON CONFLICT(contact_id, agent_key, list_key) DO UPDATE SET
                    status = 'active',
                    correlation_id = excluded.correlation_id,
                    updated_at = excluded.updated_at
                WHERE contact_list_memberships.status = 'removed'
                "#,
            )
            .bind(&change.contact_id)
            .bind(&change.agent_key)
            .bind(list_key)
            .bind(change.correlation_id.as_str())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            delta.activated += result.rows_affected() as u32;
        }

        tx.commit().await?;

        debug!(
            contact_id = %change.contact_id,
            agent_key = %change.agent_key,
            activated = delta.activated,
            removed = delta.removed,
            "Applied membership change"
        );
        Ok(delta)
    }

    /// Active list keys for one (contact, agent)
    pub async fn active_lists(&self, contact_id: &str, agent_key: &str) -> Result<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT list_key FROM contact_list_memberships
            WHERE contact_id = ? AND agent_key = ? AND status = 'active'
            "#,
        )
        .bind(contact_id)
        .bind(agent_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    /// All membership rows for a contact, active and removed
    pub async fn for_contact(&self, contact_id: &str) -> Result<Vec<ContactListMembership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT contact_id, agent_key, list_key, status, correlation_id, created_at, updated_at
            FROM contact_list_memberships WHERE contact_id = ?
            ORDER BY agent_key ASC, list_key ASC
            "#,
        )
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ContactListMembership::try_from).collect()
    }

    /// Agents that currently hold at least one active membership for the contact
    pub async fn agents_with_active(&self, contact_id: &str) -> Result<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT agent_key FROM contact_list_memberships
            WHERE contact_id = ? AND status = 'active'
            "#,
        )
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    /// Last agent the contact was seen assigned to
    pub async fn last_agent(&self, contact_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT agent_key FROM contact_agents WHERE contact_id = ?")
                .bind(contact_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(k,)| k))
    }

    pub async fn set_last_agent(&self, contact_id: &str, agent_key: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contact_agents (contact_id, agent_key, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(contact_id) DO UPDATE SET
                agent_key = excluded.agent_key,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(contact_id)
        .bind(agent_key)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Contacts with any membership or agent record, in id order after `after`
    pub async fn known_contacts(&self, after: Option<&str>, limit: u32) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT contact_id FROM (
                SELECT contact_id FROM contact_agents
                UNION
                SELECT contact_id FROM contact_list_memberships
            )
            WHERE contact_id > ?
            ORDER BY contact_id ASC
            LIMIT ?
            "#,
        )
        .bind(after.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[derive(Debug, FromRow)]
struct MembershipRow {
    contact_id: String,
    agent_key: String,
    list_key: String,
    status: String,
    correlation_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<MembershipRow> for ContactListMembership {
    type Error = SyncError;

    fn try_from(row: MembershipRow) -> Result<Self> {
        Ok(ContactListMembership {
            contact_id: row.contact_id,
            agent_key: row.agent_key,
            list_key: row.list_key,
            status: row.status.parse()?,
            correlation_id: row.correlation_id,
            created_at: parse_ts(&row.created_at, "created_at")?,
            updated_at: parse_ts(&row.updated_at, "updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CorrelationId, MembershipStatus};
    use crate::infra::Store;

    fn change(agent: &str) -> MembershipChange {
        MembershipChange::new("C1", agent, CorrelationId::from("corr"))
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = Store::in_memory().await.unwrap().memberships();

        let first = store
            .apply(&change("alice").add(["hot", "new"]))
            .await
            .unwrap();
        assert_eq!(first.activated, 2);

        let again = store
            .apply(&change("alice").add(["hot", "new"]))
            .await
            .unwrap();
        assert!(!again.changed());

        let active = store.active_lists("C1", "alice").await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_then_reactivate_keeps_one_row() {
        let store = Store::in_memory().await.unwrap().memberships();
        store.apply(&change("alice").add(["hot"])).await.unwrap();

        let removed = store.apply(&change("alice").remove(["hot"])).await.unwrap();
        assert_eq!(removed.removed, 1);
        let reactivated = store.apply(&change("alice").add(["hot"])).await.unwrap();
        assert_eq!(reactivated.activated, 1);

        let rows = store.for_contact("C1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, MembershipStatus::Active);
    }

    #[tokio::test]
    async fn test_conflicting_change_is_rejected() {
        let store = Store::in_memory().await.unwrap().memberships();
        let err = store
            .apply(&change("alice").add(["hot"]).remove(["hot"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_agent_tracking_and_paging() {
        let store = Store::in_memory().await.unwrap().memberships();
        assert_eq!(store.last_agent("C1").await.unwrap(), None);
        store.set_last_agent("C1", "alice").await.unwrap();
        store.set_last_agent("C1", "bob").await.unwrap();
        assert_eq!(store.last_agent("C1").await.unwrap().as_deref(), Some("bob"));

        store
            .apply(&MembershipChange::new("C2", "bob", CorrelationId::from("c")).add(["x"]))
            .await
            .unwrap();

        let page = store.known_contacts(None, 10).await.unwrap();
        assert_eq!(page, vec!["C1".to_string(), "C2".to_string()]);
        let next = store.known_contacts(Some("C1"), 10).await.unwrap();
        assert_eq!(next, vec!["C2".to_string()]);
    }
}
