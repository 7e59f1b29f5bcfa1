//! List catalog: which call lists a contact belongs on
//!
//! The catalog is process-wide state with an explicit lifecycle. Callers
//! `init()` it once at startup, `get()` it on every resolution and
//! `invalidate()` / `reload()` it when the rules change. Nothing loads it
//! implicitly on first use.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::ContactAttributes;
use crate::infra::{Result, SyncError};

/// Maps tags and pipeline stages onto one list key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRule {
    pub list_key: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub stages: BTreeSet<String>,
}

impl ListRule {
    pub fn matches(&self, attrs: &ContactAttributes) -> bool {
        let tag_hit = self.tags.iter().any(|t| attrs.tags.contains(t));
        let stage_hit = attrs
            .stage
            .as_ref()
            .is_some_and(|s| self.stages.contains(s));
        tag_hit || stage_hit
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCatalog {
    #[serde(default)]
    pub rules: Vec<ListRule>,
    /// Used when no rule matches
    #[serde(default)]
    pub default_list: Option<String>,
}

impl ListCatalog {
    /// Built-in rules used when no catalog file is configured
    pub fn standard() -> Self {
        let rule = |key: &str, tags: &[&str], stages: &[&str]| ListRule {
            list_key: key.to_string(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            stages: stages.iter().map(|s| s.to_string()).collect(),
        };

        Self {
            rules: vec![
                rule("hot-leads", &["hot", "hot lead"], &["hot"]),
                rule("new-leads", &["new"], &["new", "lead"]),
                rule("follow-up", &["callback", "follow up"], &["contacted"]),
                rule("appointments", &["appointment"], &["appointment set"]),
            ],
            default_list: None,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut catalog: ListCatalog = serde_json::from_str(raw)?;
        for rule in &mut catalog.rules {
            rule.tags = rule.tags.iter().map(|t| t.to_ascii_lowercase()).collect();
            rule.stages = rule.stages.iter().map(|s| s.to_ascii_lowercase()).collect();
        }
        Ok(catalog)
    }

    /// The set of list keys the contact should be on
    pub fn resolve_intent(&self, attrs: &ContactAttributes) -> BTreeSet<String> {
        let mut lists: BTreeSet<String> = self
            .rules
            .iter()
            .filter(|r| r.matches(attrs))
            .map(|r| r.list_key.clone())
            .collect();

        if lists.is_empty() {
            if let Some(default) = &self.default_list {
                lists.insert(default.clone());
            }
        }
        lists
    }
}

/// Where a [`CatalogCache`] loads its catalog from
#[derive(Debug, Clone)]
pub enum CatalogSource {
    Static(ListCatalog),
    File(PathBuf),
}

impl CatalogSource {
    /// `LIST_CATALOG_PATH` when set, otherwise the built-in rules
    pub fn from_env() -> Self {
        match std::env::var("LIST_CATALOG_PATH") {
            Ok(path) if !path.is_empty() => CatalogSource::File(PathBuf::from(path)),
            _ => CatalogSource::Static(ListCatalog::standard()),
        }
    }

    async fn load(&self) -> Result<ListCatalog> {
        match self {
            CatalogSource::Static(catalog) => Ok(catalog.clone()),
            CatalogSource::File(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    SyncError::Configuration(format!(
                        "cannot read list catalog {}: {e}",
                        path.display()
                    ))
                })?;
                ListCatalog::from_json(&raw)
            }
        }
    }
}

/// Holder of the loaded catalog
pub struct CatalogCache {
    source: CatalogSource,
    current: RwLock<Option<Arc<ListCatalog>>>,
}

impl CatalogCache {
    pub fn new(source: CatalogSource) -> Self {
        Self {
            source,
            current: RwLock::new(None),
        }
    }

    /// Cache already holding `catalog`
    pub fn with_catalog(catalog: ListCatalog) -> Self {
        Self {
            source: CatalogSource::Static(catalog.clone()),
            current: RwLock::new(Some(Arc::new(catalog))),
        }
    }

    /// Load the catalog from its source
    pub async fn init(&self) -> Result<Arc<ListCatalog>> {
        let catalog = Arc::new(self.source.load().await?);
        *self.current.write().await = Some(catalog.clone());
        info!(rules = catalog.rules.len(), "List catalog loaded");
        Ok(catalog)
    }

    /// The loaded catalog; fails if `init` has not run since the last invalidation
    pub async fn get(&self) -> Result<Arc<ListCatalog>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::Configuration("list catalog not initialized".to_string()))
    }

    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    pub async fn reload(&self) -> Result<Arc<ListCatalog>> {
        self.invalidate().await;
        self.init().await
    }
}
