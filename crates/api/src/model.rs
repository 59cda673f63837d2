use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

pub const DEFAULT_MODEL_ID: &str = "default";

/// One selectable model profile as advertised by `/api/models`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Backing provider model name, informational only.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub is_default: bool,
}

impl Model {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            model: String::new(),
            is_default: false,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ServerApi,
    CacheFresh,
    CacheStaleFallback,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub default_model: String,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_server(listing: ModelListing) -> Self {
        Self {
            default_model: listing.default_model(),
            models: listing.models,
            source: ModelCatalogSource::ServerApi,
            warning: None,
        }
    }

    pub fn from_cache_fresh(listing: ModelListing) -> Self {
        Self {
            source: ModelCatalogSource::CacheFresh,
            ..Self::from_server(listing)
        }
    }

    pub fn from_cache_stale(listing: ModelListing, warning: String) -> Self {
        Self {
            source: ModelCatalogSource::CacheStaleFallback,
            warning: Some(warning),
            ..Self::from_server(listing)
        }
    }

    pub fn from_static_fallback(warning: String) -> Self {
        Self {
            models: vec![Model {
                is_default: true,
                ..Model::new(DEFAULT_MODEL_ID, "Default")
            }],
            default_model: DEFAULT_MODEL_ID.to_string(),
            source: ModelCatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.iter().any(|model| model.id == id)
    }
}

/// `data` payload of `/api/models`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ModelListing {
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default, rename = "default")]
    pub default_id: Option<String>,
}

impl ModelListing {
    /// Server-declared default, then the flagged entry, then the first entry.
    pub fn default_model(&self) -> String {
        self.default_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                self.models
                    .iter()
                    .find(|model| model.is_default)
                    .map(|model| model.id.clone())
            })
            .or_else(|| self.models.first().map(|model| model.id.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string())
    }
}

struct CacheEntry {
    listing: ModelListing,
    fetched_at: Instant,
}

/// Model listings keyed by api base url.
pub struct ModelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(10 * 60))
    }

    pub async fn get_fresh(&self, key: &str) -> Option<ModelListing> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.listing.clone())
    }

    pub async fn get_any(&self, key: &str) -> Option<ModelListing> {
        let entries = self.entries.read().await;
        entries.get(key).map(|entry| entry.listing.clone())
    }

    pub async fn set(&self, key: &str, listing: ModelListing) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                listing,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn listing() -> ModelListing {
        ModelListing {
            models: vec![
                Model::new("fast", "Fast"),
                Model {
                    is_default: true,
                    ..Model::new("smart", "")
                },
            ],
            default_id: None,
        }
    }

    #[test]
    fn default_prefers_the_declared_id_then_the_flag() {
        assert_eq!(listing().default_model(), "smart");
        let declared = ModelListing {
            default_id: Some("fast".to_string()),
            ..listing()
        };
        assert_eq!(declared.default_model(), "fast");
        assert_eq!(ModelListing::default().default_model(), DEFAULT_MODEL_ID);
    }

    #[test]
    fn display_name_falls_back_to_the_id() {
        let models = listing().models;
        assert_eq!(models[0].display_name(), "Fast");
        assert_eq!(models[1].display_name(), "smart");
    }

    #[tokio::test]
    async fn entries_expire_but_stay_available_as_stale() {
        let cache = ModelCache::new(Duration::ZERO);
        cache.set("http://api", listing()).await;

        assert!(cache.get_fresh("http://api").await.is_none());
        assert_eq!(cache.get_any("http://api").await, Some(listing()));
    }
}
