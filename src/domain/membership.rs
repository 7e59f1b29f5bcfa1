//! Contact-to-call-list membership types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::CorrelationId;
use crate::infra::SyncError;

/// Membership row status; rows are flipped, never deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Removed,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MembershipStatus::Active),
            "removed" => Ok(MembershipStatus::Removed),
            other => Err(SyncError::InvalidInput(format!(
                "unknown membership status: {other}"
            ))),
        }
    }
}

/// "This contact belongs to this agent's named list"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactListMembership {
    pub contact_id: String,
    pub agent_key: String,
    pub list_key: String,
    pub status: MembershipStatus,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A requested membership change for one contact under one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub contact_id: String,
    pub agent_key: String,
    pub add_list_keys: BTreeSet<String>,
    pub remove_list_keys: BTreeSet<String>,
    pub correlation_id: CorrelationId,
}

impl MembershipChange {
    pub fn new(
        contact_id: impl Into<String>,
        agent_key: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            agent_key: agent_key.into(),
            add_list_keys: BTreeSet::new(),
            remove_list_keys: BTreeSet::new(),
            correlation_id,
        }
    }

    pub fn add<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_list_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn remove<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove_list_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.add_list_keys.is_empty() && self.remove_list_keys.is_empty()
    }
}

/// Counts of rows actually flipped by an apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MembershipDelta {
    pub activated: u32,
    pub removed: u32,
}

impl MembershipDelta {
    pub fn changed(&self) -> bool {
        self.activated > 0 || self.removed > 0
    }
}

impl std::ops::AddAssign for MembershipDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.activated += rhs.activated;
        self.removed += rhs.removed;
    }
}

/// The attributes list intent is resolved from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactAttributes {
    pub contact_id: String,
    /// Current owning agent, if the contact is assigned
    pub agent_key: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub stage: Option<String>,
}

impl ContactAttributes {
    /// Read attributes from a CRM contact record.
    ///
    /// Accepts `assignedTo`/`assigned_to`/`agent_key` for the agent,
    /// `tags` as an array of strings and `stage`/`pipelineStage` for the stage.
    pub fn from_crm_record(contact_id: &str, record: &serde_json::Value) -> Self {
        let agent_key = ["assignedTo", "assigned_to", "agent_key"]
            .iter()
            .find_map(|k| record.get(*k).and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let tags = record
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let stage = ["stage", "pipelineStage", "pipeline_stage"]
            .iter()
            .find_map(|k| record.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.trim().to_ascii_lowercase());

        Self {
            contact_id: contact_id.to_string(),
            agent_key,
            tags,
            stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attributes_from_crm_record() {
        let attrs = ContactAttributes::from_crm_record(
            "C1",
            &json!({"assignedTo": "alice", "tags": ["Hot Lead", "", "vip"], "pipelineStage": "New"}),
        );
        assert_eq!(attrs.agent_key.as_deref(), Some("alice"));
        assert!(attrs.tags.contains("hot lead"));
        assert!(attrs.tags.contains("vip"));
        assert_eq!(attrs.tags.len(), 2);
        assert_eq!(attrs.stage.as_deref(), Some("new"));
    }

    #[test]
    fn test_change_builder() {
        let change = MembershipChange::new("C1", "bob", CorrelationId::from("c"))
            .add(["new-leads"])
            .remove(["hot-leads"]);
        assert!(!change.is_empty());
        assert!(change.add_list_keys.contains("new-leads"));
        assert!(change.remove_list_keys.contains("hot-leads"));
    }
}
