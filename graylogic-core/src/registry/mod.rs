//! Entity registry: models, SQLite repositories, and the device cache
//!
//! The cache is read-mostly: reads take a shared lock and clone what they
//! return; every repository write is followed by a cache refresh under the
//! single writer lock.

pub mod db;
pub mod history;
pub mod models;
pub mod repository;
pub mod scenes;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::registry::models::Device;
use crate::registry::repository::Repository;

pub use history::HistoryStore;
pub use scenes::SceneStore;

/// Read-mostly in-memory view of the device table
#[derive(Clone)]
pub struct DeviceCache {
    repository: Repository,
    devices: Arc<RwLock<HashMap<String, Device>>>,
}

impl DeviceCache {
    #[must_use]
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Reload the cache from the repository.
    ///
    /// The map is cleared and rebuilt under the writer lock so deleted
    /// devices never linger.
    pub async fn refresh(&self) -> Result<()> {
        let devices = self.repository.list_devices().await?;
        let mut cache = self.devices.write().await;
        cache.clear();
        for device in devices {
            cache.insert(device.id.clone(), device);
        }
        tracing::debug!(count = cache.len(), "device cache refreshed");
        Ok(())
    }

    /// Snapshot of all devices; each entry is a deep clone
    pub async fn all(&self) -> Vec<Device> {
        let cache = self.devices.read().await;
        let mut devices: Vec<Device> = cache.values().cloned().collect();
        devices.sort_by(|a, b| a.slug.cmp(&b.slug));
        devices
    }

    /// Lookup by id or slug
    pub async fn get(&self, key: &str) -> Option<Device> {
        let cache = self.devices.read().await;
        cache
            .get(key)
            .or_else(|| cache.values().find(|d| d.slug == key))
            .cloned()
    }

    /// Merge a state patch into the cached copy without a full reload.
    ///
    /// The repository row is updated first by the caller; this keeps the
    /// cache in step on the hot path.
    pub async fn apply_state(
        &self,
        device_id: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
        updated_at: chrono::DateTime<chrono::Utc>,
    ) {
        let mut cache = self.devices.write().await;
        if let Some(device) = cache.get_mut(device_id) {
            for (key, value) in patch {
                device.state.insert(key.clone(), value.clone());
            }
            device.state_updated_at = Some(updated_at);
            device.last_seen = Some(updated_at);
            device.health = models::HealthStatus::Online;
        }
    }

    /// The backing repository
    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repository
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::db::connect_memory;
    use crate::registry::models::{Domain, DeviceType, HealthStatus, Protocol};
    use chrono::Utc;
    use uuid::Uuid;

    async fn cache_with_device() -> (DeviceCache, String) {
        let repo = Repository::new(connect_memory().await);
        let site = repo.create_site("Home", "home").await.unwrap();
        let area = repo.create_area(&site.id, "Ground", "ground").await.unwrap();
        let room = repo.create_room(&area.id, "Living", "living").await.unwrap();
        let device = models::Device {
            id: Uuid::new_v4().to_string(),
            name: "Light".into(),
            slug: "light-living-01".into(),
            room_id: Some(room.id),
            area_id: None,
            device_type: DeviceType::Light,
            domain: Domain::Lighting,
            protocol: Protocol::Knx,
            functions: HashMap::new(),
            capabilities: Vec::new(),
            config: serde_json::Map::new(),
            state: serde_json::Map::new(),
            state_updated_at: None,
            health: HealthStatus::Unknown,
            last_seen: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created = repo.create_device(&device).await.unwrap();
        let cache = DeviceCache::new(repo);
        cache.refresh().await.unwrap();
        (cache, created.id)
    }

    #[tokio::test]
    async fn refresh_clears_stale_entries() {
        let (cache, id) = cache_with_device().await;
        assert!(cache.get(&id).await.is_some());
        assert!(cache.get("light-living-01").await.is_some());

        cache.repository().delete_device(&id).await.unwrap();
        cache.refresh().await.unwrap();
        assert!(cache.get(&id).await.is_none());
        assert!(cache.all().await.is_empty());
    }

    #[tokio::test]
    async fn apply_state_updates_cached_copy() {
        let (cache, id) = cache_with_device().await;
        let mut patch = serde_json::Map::new();
        patch.insert("on".into(), serde_json::json!(true));
        cache.apply_state(&id, &patch, Utc::now()).await;

        let device = cache.get(&id).await.unwrap();
        assert_eq!(device.state.get("on"), Some(&serde_json::json!(true)));
        assert_eq!(device.health, HealthStatus::Online);
    }

    #[tokio::test]
    async fn reads_return_clones() {
        let (cache, id) = cache_with_device().await;
        let mut copy = cache.get(&id).await.unwrap();
        copy.state.insert("mutated".into(), serde_json::json!(1));
        // The cache is unaffected by mutation of the returned clone
        assert!(cache.get(&id).await.unwrap().state.get("mutated").is_none());
    }
}
