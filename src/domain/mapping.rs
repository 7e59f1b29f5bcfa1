//! Cross-system contact identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ExternalSystem;

/// Links the same real-world contact across the CRM and the dialer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactMapping {
    pub crm_id: Option<String>,
    pub dialer_id: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContactMapping {
    /// The id this contact has on `system`
    pub fn id_on(&self, system: ExternalSystem) -> Option<&str> {
        match system {
            ExternalSystem::Crm => self.crm_id.as_deref(),
            ExternalSystem::Dialer => self.dialer_id.as_deref(),
            ExternalSystem::Messaging => self.phone.as_deref(),
        }
    }
}

/// Lookup key for [`ContactMapping`] resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MappingKey {
    CrmId(String),
    DialerId(String),
    Phone(String),
    Email(String),
}

impl MappingKey {
    /// Key for an entity id as known on `system`
    pub fn for_system(system: ExternalSystem, id: impl Into<String>) -> Self {
        match system {
            ExternalSystem::Crm => MappingKey::CrmId(id.into()),
            ExternalSystem::Dialer => MappingKey::DialerId(id.into()),
            ExternalSystem::Messaging => MappingKey::Phone(normalize_phone(&id.into())),
        }
    }
}

/// Strip formatting so `+1 (555) 123-4567` and `15551234567` compare equal
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Lowercase and trim an email address
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
