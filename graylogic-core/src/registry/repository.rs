//! SQLite-backed entity repository
//!
//! All writes go through here; the in-memory device cache refreshes from
//! these queries after each mutation. JSON-typed columns (functions, state,
//! capabilities, config) are stored as TEXT and decoded on read.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::models::{
    validate_slug, Area, Device, DeviceFunction, DeviceGroup, Domain, DeviceType, GroupRules,
    HealthStatus, InfrastructureZone, Protocol, Room, Site,
};

/// Repository over the registry tables
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

fn parse_json_map(raw: &str, what: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("corrupt {what} column: {e}")))
}

fn parse_json_vec<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<Vec<T>> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("corrupt {what} column: {e}")))
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    let functions_raw: String = row.get("functions");
    let functions: HashMap<String, DeviceFunction> = serde_json::from_str(&functions_raw)
        .map_err(|e| Error::Internal(format!("corrupt functions column: {e}")))?;

    let device_type: String = row.get("device_type");
    let domain: String = row.get("domain");
    let protocol: String = row.get("protocol");
    let health: String = row.get("health");
    let capabilities: String = row.get("capabilities");
    let config: String = row.get("config");
    let state: String = row.get("state");

    Ok(Device {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        room_id: row.get("room_id"),
        area_id: row.get("area_id"),
        device_type: DeviceType::from_str(&device_type)?,
        domain: Domain::from_str(&domain)?,
        protocol: Protocol::from_str(&protocol)?,
        functions,
        capabilities: parse_json_vec(&capabilities, "capabilities")?,
        config: parse_json_map(&config, "config")?,
        state: parse_json_map(&state, "state")?,
        state_updated_at: row.get("state_updated_at"),
        health: HealthStatus::from_str(&health)?,
        last_seen: row.get("last_seen"),
        tags: Vec::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl Repository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool for modules that own their own tables
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Sites
    // ------------------------------------------------------------------

    pub async fn get_site(&self) -> Result<Site> {
        let row = sqlx::query("SELECT * FROM sites LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("site not configured".to_string()))?;

        let available_modes: String = row.get("available_modes");
        let settings: String = row.get("settings");
        Ok(Site {
            id: row.get("id"),
            name: row.get("name"),
            slug: row.get("slug"),
            latitude: row.get("latitude"),
            longitude: row.get("longitude"),
            timezone: row.get("timezone"),
            elevation_m: row.get("elevation_m"),
            current_mode: row.get("current_mode"),
            available_modes: parse_json_vec(&available_modes, "available_modes")?,
            settings: parse_json_map(&settings, "settings")?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    pub async fn create_site(&self, name: &str, slug: &str) -> Result<Site> {
        validate_slug(slug)?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sites (id, name, slug, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(name)
        .bind(slug)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_site().await
    }

    pub async fn set_site_mode(&self, mode: &str) -> Result<()> {
        let site = self.get_site().await?;
        if !site.available_modes.iter().any(|m| m == mode) {
            return Err(Error::Validation(format!("mode '{mode}' not available")));
        }
        sqlx::query("UPDATE sites SET current_mode = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(mode)
            .bind(Utc::now())
            .bind(&site.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Areas / rooms / zones
    // ------------------------------------------------------------------

    pub async fn list_areas(&self) -> Result<Vec<Area>> {
        let rows = sqlx::query("SELECT * FROM areas ORDER BY sort_order, slug")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Area {
                id: row.get("id"),
                site_id: row.get("site_id"),
                name: row.get("name"),
                slug: row.get("slug"),
                sort_order: row.get("sort_order"),
            })
            .collect())
    }

    pub async fn create_area(&self, site_id: &str, name: &str, slug: &str) -> Result<Area> {
        validate_slug(slug)?;
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO areas (id, site_id, name, slug) VALUES (?1, ?2, ?3, ?4)")
            .bind(&id)
            .bind(site_id)
            .bind(name)
            .bind(slug)
            .execute(&self.pool)
            .await?;
        Ok(Area {
            id,
            site_id: site_id.to_string(),
            name: name.to_string(),
            slug: slug.to_string(),
            sort_order: 0,
        })
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>> {
        let rows = sqlx::query("SELECT * FROM rooms ORDER BY sort_order, slug")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(room_from_row).collect())
    }

    pub async fn get_room(&self, id: &str) -> Result<Room> {
        let row = sqlx::query("SELECT * FROM rooms WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("room '{id}'")))?;
        Ok(room_from_row(&row))
    }

    pub async fn create_room(&self, area_id: &str, name: &str, slug: &str) -> Result<Room> {
        validate_slug(slug)?;
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO rooms (id, area_id, name, slug) VALUES (?1, ?2, ?3, ?4)")
            .bind(&id)
            .bind(area_id)
            .bind(name)
            .bind(slug)
            .execute(&self.pool)
            .await?;
        self.get_room(&id).await
    }

    pub async fn list_zones(&self) -> Result<Vec<InfrastructureZone>> {
        let rows = sqlx::query("SELECT * FROM infrastructure_zones ORDER BY domain, slug")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let domain: String = row.get("domain");
                Ok(InfrastructureZone {
                    id: row.get("id"),
                    site_id: row.get("site_id"),
                    domain: Domain::from_str(&domain)?,
                    name: row.get("name"),
                    slug: row.get("slug"),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY slug")
            .fetch_all(&self.pool)
            .await?;
        let mut devices: Vec<Device> = rows
            .iter()
            .map(device_from_row)
            .collect::<Result<_>>()?;

        // Merge tags in one pass instead of a query per device
        let tag_rows = sqlx::query("SELECT device_id, tag FROM device_tags ORDER BY tag")
            .fetch_all(&self.pool)
            .await?;
        let mut tags_by_device: HashMap<String, Vec<String>> = HashMap::new();
        for row in &tag_rows {
            tags_by_device
                .entry(row.get("device_id"))
                .or_default()
                .push(row.get("tag"));
        }
        for device in &mut devices {
            if let Some(tags) = tags_by_device.remove(&device.id) {
                device.tags = tags;
            }
        }
        Ok(devices)
    }

    pub async fn get_device(&self, id: &str) -> Result<Device> {
        let row = sqlx::query("SELECT * FROM devices WHERE id = ?1 OR slug = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device '{id}'")))?;
        let mut device = device_from_row(&row)?;
        let tag_rows = sqlx::query("SELECT tag FROM device_tags WHERE device_id = ?1 ORDER BY tag")
            .bind(&device.id)
            .fetch_all(&self.pool)
            .await?;
        device.tags = tag_rows.iter().map(|r| r.get("tag")).collect();
        Ok(device)
    }

    pub async fn create_device(&self, device: &Device) -> Result<Device> {
        validate_slug(&device.slug)?;
        device.validate_placement()?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO devices (id, name, slug, room_id, area_id, device_type, domain, protocol, \
             functions, capabilities, config, state, health, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.slug)
        .bind(&device.room_id)
        .bind(&device.area_id)
        .bind(device.device_type.as_str())
        .bind(device.domain.as_str())
        .bind(device.protocol.as_str())
        .bind(serde_json::to_string(&device.functions)?)
        .bind(serde_json::to_string(&device.capabilities)?)
        .bind(serde_json::to_string(&device.config)?)
        .bind(serde_json::to_string(&device.state)?)
        .bind(device.health.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        for tag in &device.tags {
            sqlx::query("INSERT OR IGNORE INTO device_tags (device_id, tag) VALUES (?1, ?2)")
                .bind(&device.id)
                .bind(tag)
                .execute(&self.pool)
                .await?;
        }
        self.get_device(&device.id).await
    }

    /// Patch mutable fields; the slug is immutable after creation
    pub async fn update_device(&self, device: &Device) -> Result<Device> {
        device.validate_placement()?;
        let result = sqlx::query(
            "UPDATE devices SET name = ?1, room_id = ?2, area_id = ?3, device_type = ?4, \
             domain = ?5, functions = ?6, capabilities = ?7, config = ?8, updated_at = ?9 \
             WHERE id = ?10",
        )
        .bind(&device.name)
        .bind(&device.room_id)
        .bind(&device.area_id)
        .bind(device.device_type.as_str())
        .bind(device.domain.as_str())
        .bind(serde_json::to_string(&device.functions)?)
        .bind(serde_json::to_string(&device.capabilities)?)
        .bind(serde_json::to_string(&device.config)?)
        .bind(Utc::now())
        .bind(&device.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("device '{}'", device.id)));
        }

        sqlx::query("DELETE FROM device_tags WHERE device_id = ?1")
            .bind(&device.id)
            .execute(&self.pool)
            .await?;
        for tag in &device.tags {
            sqlx::query("INSERT OR IGNORE INTO device_tags (device_id, tag) VALUES (?1, ?2)")
                .bind(&device.id)
                .bind(tag)
                .execute(&self.pool)
                .await?;
        }
        self.get_device(&device.id).await
    }

    pub async fn delete_device(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("device '{id}'")));
        }
        Ok(())
    }

    /// Merge a state snapshot into the stored state and mark the device online
    pub async fn merge_device_state(
        &self,
        id: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT state FROM devices WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device '{id}'")))?;
        let raw: String = row.get("state");
        let mut state = parse_json_map(&raw, "state")?;
        for (key, value) in patch {
            state.insert(key.clone(), value.clone());
        }
        sqlx::query(
            "UPDATE devices SET state = ?1, state_updated_at = ?2, health = 'online', \
             last_seen = ?2, updated_at = ?2 WHERE id = ?3",
        )
        .bind(serde_json::to_string(&state)?)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_device_health(&self, id: &str, health: HealthStatus) -> Result<()> {
        sqlx::query("UPDATE devices SET health = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(health.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Device groups
    // ------------------------------------------------------------------

    pub async fn list_groups(&self) -> Result<Vec<DeviceGroup>> {
        let rows = sqlx::query("SELECT * FROM device_groups ORDER BY slug")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let member_ids: String = row.get("member_ids");
                let rules: Option<String> = row.get("rules");
                Ok(DeviceGroup {
                    id: row.get("id"),
                    name: row.get("name"),
                    slug: row.get("slug"),
                    member_ids: parse_json_vec(&member_ids, "member_ids")?,
                    rules: match rules {
                        Some(raw) => Some(
                            serde_json::from_str::<GroupRules>(&raw)
                                .map_err(|e| Error::Internal(format!("corrupt rules: {e}")))?,
                        ),
                        None => None,
                    },
                })
            })
            .collect()
    }

    pub async fn get_group(&self, id: &str) -> Result<DeviceGroup> {
        self.list_groups()
            .await?
            .into_iter()
            .find(|g| g.id == id || g.slug == id)
            .ok_or_else(|| Error::NotFound(format!("group '{id}'")))
    }

    pub async fn create_group(&self, group: &DeviceGroup) -> Result<DeviceGroup> {
        validate_slug(&group.slug)?;
        sqlx::query(
            "INSERT INTO device_groups (id, name, slug, member_ids, rules) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(&group.slug)
        .bind(serde_json::to_string(&group.member_ids)?)
        .bind(match &group.rules {
            Some(rules) => Some(serde_json::to_string(rules)?),
            None => None,
        })
        .execute(&self.pool)
        .await?;
        Ok(group.clone())
    }

    /// Resolve a group to device ids: explicit members plus rule matches
    pub async fn resolve_group_members(&self, group: &DeviceGroup) -> Result<Vec<String>> {
        let mut ids: Vec<String> = group.member_ids.clone();
        if let Some(rules) = &group.rules {
            for device in self.list_devices().await? {
                if rules.matches(&device) && !ids.contains(&device.id) {
                    ids.push(device.id);
                }
            }
        }
        Ok(ids)
    }
}

fn room_from_row(row: &SqliteRow) -> Room {
    Room {
        id: row.get("id"),
        area_id: row.get("area_id"),
        name: row.get("name"),
        slug: row.get("slug"),
        climate_zone_id: row.get("climate_zone_id"),
        audio_zone_id: row.get("audio_zone_id"),
        sort_order: row.get("sort_order"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::db::connect_memory;
    use crate::registry::models::DeviceType;

    async fn seeded() -> (Repository, String) {
        let pool = connect_memory().await;
        let repo = Repository::new(pool);
        let site = repo.create_site("Home", "home").await.unwrap();
        let area = repo.create_area(&site.id, "Ground", "ground").await.unwrap();
        let room = repo.create_room(&area.id, "Living", "living").await.unwrap();
        (repo, room.id)
    }

    fn device(slug: &str, room_id: Option<String>) -> Device {
        Device {
            id: Uuid::new_v4().to_string(),
            name: slug.to_string(),
            slug: slug.to_string(),
            room_id,
            area_id: None,
            device_type: DeviceType::Light,
            domain: Domain::Lighting,
            protocol: Protocol::Knx,
            functions: HashMap::new(),
            capabilities: vec!["switch".into()],
            config: serde_json::Map::new(),
            state: serde_json::Map::new(),
            state_updated_at: None,
            health: HealthStatus::Unknown,
            last_seen: None,
            tags: vec!["ambient".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn device_crud_round_trip() {
        let (repo, room_id) = seeded().await;
        let created = repo
            .create_device(&device("light-living-01", Some(room_id)))
            .await
            .unwrap();
        assert_eq!(created.tags, vec!["ambient".to_string()]);

        let fetched = repo.get_device("light-living-01").await.unwrap();
        assert_eq!(fetched.id, created.id);

        repo.delete_device(&created.id).await.unwrap();
        assert!(repo.get_device(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_slug_conflicts() {
        let (repo, room_id) = seeded().await;
        repo.create_device(&device("dup", Some(room_id.clone())))
            .await
            .unwrap();
        let err = repo
            .create_device(&device("dup", Some(room_id)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn state_merge_preserves_existing_keys() {
        let (repo, room_id) = seeded().await;
        let created = repo
            .create_device(&device("light-1", Some(room_id)))
            .await
            .unwrap();

        let mut first = serde_json::Map::new();
        first.insert("on".into(), serde_json::json!(true));
        repo.merge_device_state(&created.id, &first, Utc::now())
            .await
            .unwrap();

        let mut second = serde_json::Map::new();
        second.insert("level".into(), serde_json::json!(75));
        repo.merge_device_state(&created.id, &second, Utc::now())
            .await
            .unwrap();

        let fetched = repo.get_device(&created.id).await.unwrap();
        assert_eq!(fetched.state.get("on"), Some(&serde_json::json!(true)));
        assert_eq!(fetched.state.get("level"), Some(&serde_json::json!(75)));
        assert_eq!(fetched.health, HealthStatus::Online);
        assert!(fetched.state_updated_at.is_some());
    }

    #[tokio::test]
    async fn dynamic_group_resolution() {
        let (repo, room_id) = seeded().await;
        let lit = repo
            .create_device(&device("light-a", Some(room_id.clone())))
            .await
            .unwrap();
        let mut sensor = device("sensor-a", Some(room_id));
        sensor.domain = Domain::Climate;
        sensor.device_type = DeviceType::Sensor;
        repo.create_device(&sensor).await.unwrap();

        let group = DeviceGroup {
            id: Uuid::new_v4().to_string(),
            name: "All lights".into(),
            slug: "all-lights".into(),
            member_ids: Vec::new(),
            rules: Some(GroupRules {
                domains: vec![Domain::Lighting],
                ..Default::default()
            }),
        };
        repo.create_group(&group).await.unwrap();
        let members = repo.resolve_group_members(&group).await.unwrap();
        assert_eq!(members, vec![lit.id]);
    }
}
