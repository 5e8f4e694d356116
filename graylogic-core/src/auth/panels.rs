//! Wall-panel identity
//!
//! A panel authenticates with `X-Panel-Token`; the token is an opaque secret
//! hashed at rest and revealed exactly once, on creation. A panel's access
//! scope is its room set.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::auth::refresh::{generate_secret, hash_secret};
use crate::error::{Error, Result};

/// A registered wall panel
#[derive(Debug, Clone, Serialize)]
pub struct Panel {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub room_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request context for an authenticated panel
#[derive(Debug, Clone)]
pub struct PanelContext {
    pub panel_id: String,
    pub name: String,
    /// The panel's access scope
    pub room_ids: Vec<String>,
}

#[derive(Clone)]
pub struct PanelStore {
    pool: SqlitePool,
}

impl PanelStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Panel>> {
        let rows = sqlx::query("SELECT * FROM panels ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut panels = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            panels.push(Panel {
                room_ids: self.room_ids(&id).await?,
                id: row.get("id"),
                name: row.get("name"),
                is_active: row.get("is_active"),
                last_seen: row.get("last_seen"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }
        Ok(panels)
    }

    pub async fn get(&self, id: &str) -> Result<Panel> {
        let row = sqlx::query("SELECT * FROM panels WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("panel '{id}'")))?;
        Ok(Panel {
            room_ids: self.room_ids(id).await?,
            id: row.get("id"),
            name: row.get("name"),
            is_active: row.get("is_active"),
            last_seen: row.get("last_seen"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn room_ids(&self, panel_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT room_id FROM panel_rooms WHERE panel_id = ?1")
            .bind(panel_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("room_id")).collect())
    }

    /// Create a panel; the returned secret is shown once and never again
    pub async fn create(&self, name: &str, room_ids: &[String]) -> Result<(Panel, String)> {
        let id = Uuid::new_v4().to_string();
        let secret = generate_secret();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO panels (id, name, token_hash, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 1, ?4, ?4)",
        )
        .bind(&id)
        .bind(name)
        .bind(hash_secret(&secret))
        .bind(now)
        .execute(&mut *tx)
        .await?;
        for room_id in room_ids {
            sqlx::query("INSERT INTO panel_rooms (panel_id, room_id) VALUES (?1, ?2)")
                .bind(&id)
                .bind(room_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok((self.get(&id).await?, secret))
    }

    /// Persist name, active flag, and room scope changes
    pub async fn update(
        &self,
        id: &str,
        name: Option<&str>,
        is_active: Option<bool>,
        room_ids: Option<&[String]>,
    ) -> Result<Panel> {
        let current = self.get(id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE panels SET name = ?1, is_active = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(name.unwrap_or(&current.name))
            .bind(is_active.unwrap_or(current.is_active))
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if let Some(room_ids) = room_ids {
            sqlx::query("DELETE FROM panel_rooms WHERE panel_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            for room_id in room_ids {
                sqlx::query("INSERT INTO panel_rooms (panel_id, room_id) VALUES (?1, ?2)")
                    .bind(id)
                    .bind(room_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM panels WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("panel '{id}'")));
        }
        Ok(())
    }

    /// Authenticate a presented panel token and record the sighting
    pub async fn authenticate(&self, token: &str) -> Result<PanelContext> {
        let hash = hash_secret(token);
        let row = sqlx::query("SELECT id, name, is_active FROM panels WHERE token_hash = ?1")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Unauthenticated("unknown panel token".to_string()))?;

        let is_active: bool = row.get("is_active");
        if !is_active {
            return Err(Error::Unauthenticated("panel disabled".to_string()));
        }
        let panel_id: String = row.get("id");

        sqlx::query("UPDATE panels SET last_seen = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(&panel_id)
            .execute(&self.pool)
            .await?;

        Ok(PanelContext {
            room_ids: self.room_ids(&panel_id).await?,
            panel_id,
            name: row.get("name"),
        })
    }
}
