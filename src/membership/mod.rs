//! List-membership reconciler
//!
//! Keeps a contact's call-list memberships in line with its current intent
//! and its owning agent. Only one agent's lists may be active for a contact
//! at a time.
//!
//! Reassignment runs in a fixed order:
//! 1. remove the contact from every active list of any other agent
//! 2. resolve list intent from the contact's present attributes
//! 3. add the contact to those lists under the new agent
//! 4. persist the new agent as last known
//!
//! Steps 1 and 3 are separate transactions. A crash between them leaves the
//! contact on no list at all, which the next sweep repairs; it never leaves
//! the contact active under two agents.

mod catalog;

pub use catalog::{CatalogCache, CatalogSource, ListCatalog, ListRule};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use crate::domain::{ContactAttributes, CorrelationId, MembershipChange, MembershipDelta};
use crate::infra::{Result, SqliteMembershipStore};

/// What `reconcile_contact` did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContactReconcileOutcome {
    pub delta: MembershipDelta,
    pub reassigned: bool,
    pub previous_agent: Option<String>,
    pub agent: Option<String>,
}

pub struct MembershipReconciler {
    store: SqliteMembershipStore,
    catalog: Arc<CatalogCache>,
}

impl MembershipReconciler {
    pub fn new(store: SqliteMembershipStore, catalog: Arc<CatalogCache>) -> Self {
        Self { store, catalog }
    }

    pub fn store(&self) -> &SqliteMembershipStore {
        &self.store
    }

    /// The single write path for membership rows
    pub async fn apply_membership_change(&self, change: &MembershipChange) -> Result<MembershipDelta> {
        self.store.apply(change).await
    }

    pub async fn resolve_intent(&self, attrs: &ContactAttributes) -> Result<BTreeSet<String>> {
        Ok(self.catalog.get().await?.resolve_intent(attrs))
    }

    /// Move a contact's memberships from whichever agents hold them to `new_agent`
    #[instrument(skip(self, attrs), fields(contact_id = %attrs.contact_id))]
    pub async fn reassign(
        &self,
        attrs: &ContactAttributes,
        new_agent: &str,
        correlation_id: &CorrelationId,
    ) -> Result<MembershipDelta> {
        let contact_id = attrs.contact_id.as_str();
        let mut delta = self
            .release_other_agents(contact_id, Some(new_agent), correlation_id)
            .await?;

        let intent = self.resolve_intent(attrs).await?;
        delta += self
            .converge(contact_id, new_agent, &intent, correlation_id)
            .await?;

        self.store.set_last_agent(contact_id, new_agent).await?;

        info!(
            agent = new_agent,
            activated = delta.activated,
            removed = delta.removed,
            "Contact reassigned"
        );
        Ok(delta)
    }

    /// Bring one contact's memberships in line with its attributes
    #[instrument(skip(self, attrs), fields(contact_id = %attrs.contact_id))]
    pub async fn reconcile_contact(
        &self,
        attrs: &ContactAttributes,
        correlation_id: &CorrelationId,
    ) -> Result<ContactReconcileOutcome> {
        let contact_id = attrs.contact_id.as_str();
        let previous_agent = self.store.last_agent(contact_id).await?;

        let Some(agent) = attrs.agent_key.as_deref() else {
            // Unassigned contacts belong on no list.
            let delta = self
                .release_other_agents(contact_id, None, correlation_id)
                .await?;
            return Ok(ContactReconcileOutcome {
                delta,
                reassigned: false,
                previous_agent,
                agent: None,
            });
        };

        let stray = self
            .store
            .agents_with_active(contact_id)
            .await?
            .into_iter()
            .any(|a| a != agent);

        if previous_agent.as_deref() != Some(agent) || stray {
            let delta = self.reassign(attrs, agent, correlation_id).await?;
            return Ok(ContactReconcileOutcome {
                delta,
                reassigned: previous_agent.as_deref() != Some(agent),
                previous_agent,
                agent: Some(agent.to_string()),
            });
        }

        let intent = self.resolve_intent(attrs).await?;
        let delta = self
            .converge(contact_id, agent, &intent, correlation_id)
            .await?;

        Ok(ContactReconcileOutcome {
            delta,
            reassigned: false,
            previous_agent,
            agent: Some(agent.to_string()),
        })
    }

    /// Remove every active membership held by agents other than `keep`
    async fn release_other_agents(
        &self,
        contact_id: &str,
        keep: Option<&str>,
        correlation_id: &CorrelationId,
    ) -> Result<MembershipDelta> {
        let mut delta = MembershipDelta::default();
        for agent in self.store.agents_with_active(contact_id).await? {
            if Some(agent.as_str()) == keep {
                continue;
            }
            let active = self.store.active_lists(contact_id, &agent).await?;
            let change =
                MembershipChange::new(contact_id, agent.as_str(), correlation_id.clone()).remove(active);
            delta += self.apply_membership_change(&change).await?;
        }
        Ok(delta)
    }

    /// Diff active lists under `agent` against `intent` and apply both sides at once
    async fn converge(
        &self,
        contact_id: &str,
        agent: &str,
        intent: &BTreeSet<String>,
        correlation_id: &CorrelationId,
    ) -> Result<MembershipDelta> {
        let active = self.store.active_lists(contact_id, agent).await?;
        let change = MembershipChange::new(contact_id, agent, correlation_id.clone())
            .add(intent.difference(&active).cloned())
            .remove(active.difference(intent).cloned());
        self.apply_membership_change(&change).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MembershipStatus;
    use crate::infra::Store;

    fn catalog() -> ListCatalog {
        ListCatalog::from_json(
            r#"{"rules": [
                {"list_key": "hot-leads", "tags": ["hot"]},
                {"list_key": "new-leads", "stages": ["new"]}
            ]}"#,
        )
        .unwrap()
    }

    async fn reconciler() -> MembershipReconciler {
        let store = Store::in_memory().await.unwrap();
        MembershipReconciler::new(
            store.memberships(),
            Arc::new(CatalogCache::with_catalog(catalog())),
        )
    }

    fn attrs(agent: Option<&str>, tags: &[&str], stage: Option<&str>) -> ContactAttributes {
        ContactAttributes {
            contact_id: "C1".into(),
            agent_key: agent.map(str::to_string),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            stage: stage.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_first_sight_assigns_lists() {
        let r = reconciler().await;
        let corr = CorrelationId::new();
        let outcome = r
            .reconcile_contact(&attrs(Some("alice"), &["hot"], None), &corr)
            .await
            .unwrap();

        assert!(outcome.reassigned);
        assert_eq!(outcome.delta.activated, 1);
        assert_eq!(
            r.store().last_agent("C1").await.unwrap().as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_reassignment_moves_lists() {
        let r = reconciler().await;
        let corr = CorrelationId::new();
        r.reconcile_contact(&attrs(Some("alice"), &["hot"], None), &corr)
            .await
            .unwrap();

        let outcome = r
            .reconcile_contact(&attrs(Some("bob"), &[], Some("new")), &corr)
            .await
            .unwrap();
        assert!(outcome.reassigned);
        assert_eq!(outcome.previous_agent.as_deref(), Some("alice"));

        let rows = r.store().for_contact("C1").await.unwrap();
        let active: Vec<_> = rows
            .iter()
            .filter(|m| m.status == MembershipStatus::Active)
            .map(|m| (m.agent_key.as_str(), m.list_key.as_str()))
            .collect();
        assert_eq!(active, vec![("bob", "new-leads")]);
        assert!(rows.iter().any(|m| m.agent_key == "alice"
            && m.list_key == "hot-leads"
            && m.status == MembershipStatus::Removed));
    }

    #[tokio::test]
    async fn test_same_agent_diffs_intent() {
        let r = reconciler().await;
        let corr = CorrelationId::new();
        r.reconcile_contact(&attrs(Some("alice"), &["hot"], None), &corr)
            .await
            .unwrap();

        let outcome = r
            .reconcile_contact(&attrs(Some("alice"), &[], Some("new")), &corr)
            .await
            .unwrap();
        assert!(!outcome.reassigned);
        assert_eq!(outcome.delta.activated, 1);
        assert_eq!(outcome.delta.removed, 1);

        let again = r
            .reconcile_contact(&attrs(Some("alice"), &[], Some("new")), &corr)
            .await
            .unwrap();
        assert!(!again.delta.changed());
    }

    #[tokio::test]
    async fn test_stray_memberships_are_repaired() {
        let r = reconciler().await;
        let corr = CorrelationId::new();
        r.reconcile_contact(&attrs(Some("bob"), &["hot"], None), &corr)
            .await
            .unwrap();

        // A half-finished reassignment left an active row under alice.
        r.apply_membership_change(
            &MembershipChange::new("C1", "alice", corr.clone()).add(["hot-leads"]),
        )
        .await
        .unwrap();

        r.reconcile_contact(&attrs(Some("bob"), &["hot"], None), &corr)
            .await
            .unwrap();
        assert!(r.store().active_lists("C1", "alice").await.unwrap().is_empty());
        assert_eq!(r.store().active_lists("C1", "bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unassigned_contact_leaves_all_lists() {
        let r = reconciler().await;
        let corr = CorrelationId::new();
        r.reconcile_contact(&attrs(Some("alice"), &["hot"], None), &corr)
            .await
            .unwrap();

        let outcome = r
            .reconcile_contact(&attrs(None, &["hot"], None), &corr)
            .await
            .unwrap();
        assert_eq!(outcome.delta.removed, 1);
        assert!(r.store().agents_with_active("C1").await.unwrap().is_empty());
    }
}
