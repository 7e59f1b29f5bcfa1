//! Built-in sync handlers
//!
//! [`ContactSyncHandler`] mirrors contact changes between the CRM and the
//! dialer. [`MessageSyncHandler`] records inbound messages on the matching
//! CRM contact. Every write goes through [`stamp_origin`] first.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::collaborators::ExternalSystems;
use crate::domain::{
    normalize_phone, ContactAttributes, ContactMapping, EventSource, ExternalSystem, MappingKey,
    SyncDirection,
};
use crate::infra::{Result, SqliteMappingStore, SyncError};
use crate::origin::{stamp_origin, ORIGIN_MARKER};
use crate::router::{HandlerContext, HandlerOutcome, SyncHandler};

/// Contact fields carried across systems
const CONTACT_FIELDS: &[&str] = &[
    "firstName",
    "lastName",
    "first_name",
    "last_name",
    "name",
    "email",
    "phone",
    "tags",
    "stage",
    "pipelineStage",
    "assignedTo",
    "assigned_to",
];

/// Pull the contact object out of any known payload shape
fn contact_fields(payload: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    let body = payload
        .get("contact")
        .or_else(|| payload.get("data"))
        .filter(|v| v.is_object())
        .unwrap_or(payload);
    body.as_object().cloned().unwrap_or_default()
}

fn outbound_fields(
    record: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    for key in CONTACT_FIELDS {
        if let Some(value) = record.get(*key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(serde_json::Value::Array(tags)) = out.get_mut("tags") {
        tags.retain(|t| !t.as_str().is_some_and(|s| s.starts_with(ORIGIN_MARKER)));
    }
    out
}

fn string_field(record: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub struct ContactSyncHandler {
    systems: Arc<dyn ExternalSystems>,
    mappings: SqliteMappingStore,
}

impl ContactSyncHandler {
    pub fn new(systems: Arc<dyn ExternalSystems>, mappings: SqliteMappingStore) -> Self {
        Self { systems, mappings }
    }

    /// Find the contact's id on `target`, by system id first and then by phone
    async fn target_id(
        &self,
        from: ExternalSystem,
        target: ExternalSystem,
        entity_id: &str,
        phone: Option<&str>,
    ) -> Result<Option<String>> {
        let by_id = self
            .systems
            .resolve_mapping(&MappingKey::for_system(from, entity_id))
            .await?;
        if let Some(id) = by_id.as_ref().and_then(|m| m.id_on(target)) {
            return Ok(Some(id.to_string()));
        }

        let Some(phone) = phone else {
            return Ok(None);
        };
        let by_phone = self
            .systems
            .resolve_mapping(&MappingKey::Phone(normalize_phone(phone)))
            .await?;
        Ok(by_phone.and_then(|m| m.id_on(target).map(str::to_string)))
    }
}

#[async_trait]
impl SyncHandler for ContactSyncHandler {
    fn name(&self) -> &'static str {
        "contact-sync"
    }

    async fn handle(&self, ctx: &HandlerContext) -> Result<HandlerOutcome> {
        let (from, target) = match ctx.source {
            EventSource::Crm => (ExternalSystem::Crm, ExternalSystem::Dialer),
            EventSource::Dialer => (ExternalSystem::Dialer, ExternalSystem::Crm),
            other => {
                return Err(SyncError::InvalidInput(format!(
                    "contact sync does not handle {other} events"
                )))
            }
        };

        if ctx.event_type.ends_with(".deleted") {
            return Ok(HandlerOutcome::Skipped {
                reason: "contact deletes are not propagated".to_string(),
            });
        }

        // Prefer the current record over the webhook snapshot.
        let record = match self.systems.fetch_entity(from, &ctx.entity_id).await? {
            Some(entity) => entity.fields.as_object().cloned().unwrap_or_default(),
            None => contact_fields(&ctx.payload),
        };

        let mut fields = outbound_fields(&record);
        if fields.is_empty() {
            return Ok(HandlerOutcome::Skipped {
                reason: "no syncable contact fields".to_string(),
            });
        }

        let phone = string_field(&record, "phone");
        let email = string_field(&record, "email");
        let target_id = self
            .target_id(from, target, &ctx.entity_id, phone.as_deref())
            .await?;

        stamp_origin(target, &mut fields, &ctx.correlation_id);
        let written = self
            .systems
            .upsert_entity(target, target_id, fields, &ctx.correlation_id)
            .await?;

        let (crm_id, dialer_id) = match from {
            ExternalSystem::Crm => (ctx.entity_id.clone(), written.id.clone()),
            _ => (written.id.clone(), ctx.entity_id.clone()),
        };
        self.mappings
            .upsert(&ContactMapping {
                crm_id: Some(crm_id.clone()),
                dialer_id: Some(dialer_id),
                phone,
                email,
                updated_at: Utc::now(),
            })
            .await?;

        let attrs = ContactAttributes::from_crm_record(
            &crm_id,
            &serde_json::Value::Object(match from {
                ExternalSystem::Crm => record,
                _ => written.fields.as_object().cloned().unwrap_or_default(),
            }),
        );
        debug!(target_id = %written.id, agent = ?attrs.agent_key, "Contact propagated");

        Ok(HandlerOutcome::Synced {
            target_id: Some(written.id),
            direction: SyncDirection::new(from, target),
            contact: attrs.agent_key.is_some().then_some(attrs),
        })
    }
}

pub struct MessageSyncHandler {
    systems: Arc<dyn ExternalSystems>,
}

impl MessageSyncHandler {
    pub fn new(systems: Arc<dyn ExternalSystems>) -> Self {
        Self { systems }
    }
}

#[async_trait]
impl SyncHandler for MessageSyncHandler {
    fn name(&self) -> &'static str {
        "message-sync"
    }

    async fn handle(&self, ctx: &HandlerContext) -> Result<HandlerOutcome> {
        let message = ctx
            .payload
            .get("message")
            .filter(|v| v.is_object())
            .unwrap_or(&ctx.payload);
        let from = message.get("from").and_then(|v| v.as_str()).unwrap_or("");
        let body = message.get("body").and_then(|v| v.as_str()).unwrap_or("");

        let mapping = self
            .systems
            .resolve_mapping(&MappingKey::Phone(normalize_phone(from)))
            .await?;
        let Some(crm_id) = mapping.and_then(|m| m.crm_id) else {
            return Ok(HandlerOutcome::Skipped {
                reason: "no CRM contact for sender".to_string(),
            });
        };

        let mut fields = serde_json::Map::new();
        fields.insert(
            "lastMessage".to_string(),
            serde_json::json!({ "id": ctx.entity_id, "body": body }),
        );
        stamp_origin(ExternalSystem::Crm, &mut fields, &ctx.correlation_id);

        let written = self
            .systems
            .upsert_entity(ExternalSystem::Crm, Some(crm_id), fields, &ctx.correlation_id)
            .await?;

        Ok(HandlerOutcome::Synced {
            target_id: Some(written.id),
            direction: SyncDirection::new(ExternalSystem::Messaging, ExternalSystem::Crm),
            contact: None,
        })
    }
}
