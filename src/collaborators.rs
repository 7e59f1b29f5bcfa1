//! Contracts for the external platforms the pipeline writes to
//!
//! The real CRM, dialer and messaging clients live outside this crate. The
//! core only needs to fetch an entity, upsert one (always carrying the
//! origin marker) and resolve a cross-system mapping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{ContactMapping, CorrelationId, ExternalSystem, MappingKey};
use crate::infra::{Result, SqliteMappingStore, SyncError};
use crate::origin::is_stamped;

/// A record as an external system returns it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub system: ExternalSystem,
    pub id: String,
    pub fields: serde_json::Value,
}

/// Narrow contract over the external platforms
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExternalSystems: Send + Sync {
    /// `Ok(None)` when the system has no such record
    async fn fetch_entity(&self, system: ExternalSystem, id: &str) -> Result<Option<Entity>>;

    /// Create (`id: None`) or update a record.
    ///
    /// `fields` must already carry the origin marker; see
    /// [`crate::origin::stamp_origin`].
    async fn upsert_entity(
        &self,
        system: ExternalSystem,
        id: Option<String>,
        fields: serde_json::Map<String, serde_json::Value>,
        correlation_id: &CorrelationId,
    ) -> Result<Entity>;

    async fn resolve_mapping(&self, key: &MappingKey) -> Result<Option<ContactMapping>>;
}

/// One outbound write observed by [`InMemorySystems`]
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub system: ExternalSystem,
    pub id: String,
    pub fields: serde_json::Value,
    pub correlation_id: CorrelationId,
}

#[derive(Default)]
struct InMemoryState {
    records: HashMap<(ExternalSystem, String), serde_json::Value>,
    writes: Vec<RecordedWrite>,
    /// Queued failures per system, consumed one per call
    failures: HashMap<ExternalSystem, Vec<String>>,
}

/// Development and test implementation backed by process memory and the
/// mapping table
pub struct InMemorySystems {
    state: Mutex<InMemoryState>,
    mappings: SqliteMappingStore,
    next_id: AtomicU64,
}

impl InMemorySystems {
    pub fn new(mappings: SqliteMappingStore) -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            mappings,
            next_id: AtomicU64::new(1),
        }
    }

    /// Seed a record without recording a write
    pub async fn put(&self, system: ExternalSystem, id: &str, fields: serde_json::Value) {
        self.state
            .lock()
            .await
            .records
            .insert((system, id.to_string()), fields);
    }

    /// Make the next `times` calls against `system` fail with `message`
    pub async fn fail_next(&self, system: ExternalSystem, message: &str, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(system).or_default();
        queue.extend(std::iter::repeat(message.to_string()).take(times));
    }

    /// Every write performed so far, in order
    pub async fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().await.writes.clone()
    }

    fn take_failure(state: &mut InMemoryState, system: ExternalSystem) -> Option<String> {
        let queue = state.failures.get_mut(&system)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

#[async_trait]
impl ExternalSystems for InMemorySystems {
    async fn fetch_entity(&self, system: ExternalSystem, id: &str) -> Result<Option<Entity>> {
        let mut state = self.state.lock().await;
        if let Some(message) = Self::take_failure(&mut state, system) {
            return Err(SyncError::HandlerFailure(message));
        }

        Ok(state
            .records
            .get(&(system, id.to_string()))
            .map(|fields| Entity {
                system,
                id: id.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn upsert_entity(
        &self,
        system: ExternalSystem,
        id: Option<String>,
        fields: serde_json::Map<String, serde_json::Value>,
        correlation_id: &CorrelationId,
    ) -> Result<Entity> {
        let fields = serde_json::Value::Object(fields);
        if !is_stamped(system, &fields) {
            return Err(SyncError::InvalidInput(format!(
                "write to {system} is missing the origin marker"
            )));
        }

        let mut state = self.state.lock().await;
        if let Some(message) = Self::take_failure(&mut state, system) {
            return Err(SyncError::HandlerFailure(message));
        }

        let id = id.unwrap_or_else(|| {
            format!("{system}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
        });

        let merged = match state.records.remove(&(system, id.clone())) {
            Some(serde_json::Value::Object(mut existing)) => {
                if let serde_json::Value::Object(update) = &fields {
                    for (k, v) in update {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                serde_json::Value::Object(existing)
            }
            _ => fields.clone(),
        };

        state.records.insert((system, id.clone()), merged.clone());
        state.writes.push(RecordedWrite {
            system,
            id: id.clone(),
            fields,
            correlation_id: correlation_id.clone(),
        });
        debug!(system = %system, id = %id, "Recorded outbound write");

        Ok(Entity {
            system,
            id,
            fields: merged,
        })
    }

    async fn resolve_mapping(&self, key: &MappingKey) -> Result<Option<ContactMapping>> {
        self.mappings.resolve(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::Store;
    use crate::origin::stamp_origin;
    use serde_json::json;

    async fn systems() -> InMemorySystems {
        InMemorySystems::new(Store::in_memory().await.unwrap().mappings())
    }

    #[tokio::test]
    async fn test_unstamped_writes_are_refused() {
        let systems = systems().await;
        let mut fields = serde_json::Map::new();
        fields.insert("phone".into(), json!("+1"));

        let err = systems
            .upsert_entity(ExternalSystem::Dialer, None, fields, &CorrelationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        assert!(systems.writes().await.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_merges_and_records() {
        let systems = systems().await;
        systems
            .put(ExternalSystem::Crm, "C1", json!({"firstName": "Ada"}))
            .await;

        let corr = CorrelationId::from("corr-1");
        let mut fields = serde_json::Map::new();
        fields.insert("phone".into(), json!("+1"));
        stamp_origin(ExternalSystem::Crm, &mut fields, &corr);

        let entity = systems
            .upsert_entity(ExternalSystem::Crm, Some("C1".into()), fields, &corr)
            .await
            .unwrap();
        assert_eq!(entity.fields["firstName"], json!("Ada"));
        assert_eq!(entity.fields["phone"], json!("+1"));
        assert_eq!(systems.writes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_is_consumed() {
        let systems = systems().await;
        systems
            .fail_next(ExternalSystem::Crm, "503 upstream", 1)
            .await;

        assert!(systems
            .fetch_entity(ExternalSystem::Crm, "C1")
            .await
            .is_err());
        assert!(systems
            .fetch_entity(ExternalSystem::Crm, "C1")
            .await
            .unwrap()
            .is_none());
    }
}
