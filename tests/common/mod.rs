//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use df_middleware::auth::AdminSecret;
use df_middleware::collaborators::{ExternalSystems, InMemorySystems};
use df_middleware::domain::{EventSource, NewEvent};
use df_middleware::infra::{RetryPolicy, Store};
use df_middleware::membership::{CatalogSource, ListCatalog};
use df_middleware::reconcile::ReconcileConfig;
use df_middleware::router::DEFAULT_ECHO_WINDOW;
use df_middleware::scheduler::{DrainOptions, SchedulerConfig};
use df_middleware::server::{build_services, Config, Services};

/// Admin secret every test harness is configured with
pub const TEST_ADMIN_SECRET: &str = "test-admin-secret";

/// Configuration with zero retry delays and no background timers
pub fn test_config(max_attempts: u32) -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_connections: 1,
        admin_secret: Some(AdminSecret::new(TEST_ADMIN_SECRET).unwrap()),
        handler_timeout: Duration::from_secs(5),
        echo_window: DEFAULT_ECHO_WINDOW,
        scheduler: SchedulerConfig {
            retry: RetryPolicy::immediate(max_attempts),
            drain: DrainOptions {
                pause: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        },
        reconcile: ReconcileConfig {
            interval: Duration::ZERO,
            ..Default::default()
        },
        catalog: CatalogSource::Static(ListCatalog::standard()),
    }
}

/// Full service graph over an in-memory store and in-memory platforms
pub struct Harness {
    pub services: Services,
    pub systems: Arc<InMemorySystems>,
}

impl Harness {
    pub fn store(&self) -> &Store {
        &self.services.store
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config(3)).await
}

pub async fn harness_with(config: Config) -> Harness {
    let store = Store::in_memory().await.unwrap();
    let systems = Arc::new(InMemorySystems::new(store.mappings()));
    let services = build_services(store, systems.clone() as Arc<dyn ExternalSystems>, &config)
        .await
        .unwrap();
    Harness { services, systems }
}

/// A file-backed WAL database that survives across pool connections
pub async fn file_store(dir: &tempfile::TempDir, max_connections: u32) -> Store {
    let path = dir.path().join("ledger.db");
    let url = format!("sqlite://{}", path.display());
    Store::connect(&url, max_connections).await.unwrap()
}

/// CRM webhook body for a contact change
pub fn crm_contact_payload(contact_id: &str, phone: &str) -> serde_json::Value {
    json!({
        "event": "contact.updated",
        "contact": {
            "id": contact_id,
            "phone": phone,
            "firstName": "Jane",
            "lastName": "Doe"
        }
    })
}

/// Dialer webhook body for a completed call
pub fn dialer_call_payload(contact_id: &str, call_id: &str) -> serde_json::Value {
    json!({
        "event": "call.completed",
        "data": { "contact_id": contact_id, "call_id": call_id }
    })
}

pub fn new_event(source: EventSource, entity_id: &str) -> NewEvent {
    NewEvent::new(
        source,
        "contact.updated",
        "contact",
        entity_id,
        json!({ "contactId": entity_id }),
    )
    .unwrap()
}
